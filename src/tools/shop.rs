//! 店铺工具：内置的工具登记（目录搜索、购物车、订单、政策）与按工具的结果类型
//!
//! 外部服务返回的 JSON 形状松散，可能是已解析对象，也可能是（多次）编码后的字符串；
//! decode_payload 统一处理，再由 ShopOutput::decode 尽量落到强类型，失败时保留原值。

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::tools::{ParamKind, ToolRegistry, ToolSchema};

pub const SEARCH_CATALOG: &str = "search_shop_catalog";
pub const GET_CART: &str = "get_cart";
pub const UPDATE_CART: &str = "update_cart";
pub const GET_ORDER_STATUS: &str = "get_order_status";
pub const SEARCH_POLICIES: &str = "search_shop_policies_and_faqs";

/// 字符串最多再解码几层
const MAX_DECODE_DEPTH: usize = 3;

/// 注册全部店铺工具
pub fn register_shop_tools(registry: &mut ToolRegistry) {
    registry.register(
        ToolSchema::new(
            SEARCH_CATALOG,
            "Search the store catalog for products matching a query.",
        )
        .required("query", ParamKind::String, "What the customer is looking for")
        .optional("context", ParamKind::String, "Extra context such as size or budget")
        .optional("limit", ParamKind::Integer, "Maximum number of products"),
    );
    registry.register(
        ToolSchema::new(GET_CART, "Fetch the customer's current cart.")
            .optional("cart_id", ParamKind::String, "Cart identifier"),
    );
    registry.register(
        ToolSchema::new(UPDATE_CART, "Add, change or remove cart lines.")
            .required(
                "lines",
                ParamKind::Array,
                "Lines as {merchandise_id, quantity}; quantity 0 removes the line",
            )
            .optional("cart_id", ParamKind::String, "Cart identifier; omitted creates a cart"),
    );
    registry.register(
        ToolSchema::new(GET_ORDER_STATUS, "Look up the status of an order.")
            .required("order_id", ParamKind::String, "Order number"),
    );
    registry.register(
        ToolSchema::new(
            SEARCH_POLICIES,
            "Answer questions about shipping, returns and other store policies.",
        )
        .required("query", ParamKind::String, "The policy question"),
    );
}

/// 内置工具注册表
pub fn shop_registry() -> ToolRegistry {
    let mut r = ToolRegistry::new();
    register_shop_tools(&mut r);
    r
}

/// 把（可能多次编码的）JSON 字符串还原为值；普通文本原样保留
pub fn decode_payload(mut value: Value) -> Value {
    for _ in 0..MAX_DECODE_DEPTH {
        let parsed = match &value {
            Value::String(s) => {
                let t = s.trim();
                if t.starts_with('{') || t.starts_with('[') || t.starts_with('"') {
                    serde_json::from_str::<Value>(t).ok()
                } else {
                    None
                }
            }
            _ => None,
        };
        match parsed {
            Some(v) => value = v,
            None => break,
        }
    }
    value
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Product {
    #[serde(default)]
    pub id: Option<String>,
    pub title: String,
    #[serde(default)]
    pub price: Option<String>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub available: Option<bool>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CatalogResults {
    pub products: Vec<Product>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CartLine {
    pub merchandise_id: String,
    #[serde(default)]
    pub title: Option<String>,
    pub quantity: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Cart {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub lines: Vec<CartLine>,
    #[serde(default)]
    pub total: Option<String>,
    #[serde(default)]
    pub checkout_url: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderStatus {
    pub order_id: String,
    pub status: String,
    #[serde(default)]
    pub tracking_url: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PolicyAnswer {
    #[serde(default)]
    pub question: Option<String>,
    pub answer: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PolicyAnswers {
    pub answers: Vec<PolicyAnswer>,
}

/// 按工具区分的结果；序列化时不带标签，直接是规范化后的对象
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ShopOutput {
    Catalog(CatalogResults),
    Cart(Cart),
    Order(OrderStatus),
    Policies(PolicyAnswers),
    Raw(Value),
}

impl ShopOutput {
    /// 先做防御性解码，再按工具名尝试强类型；不匹配时退回 Raw
    pub fn decode(tool: &str, raw: Value) -> Self {
        let value = decode_payload(raw);
        let typed = match tool {
            SEARCH_CATALOG => {
                let v = match value.clone() {
                    Value::Array(items) => serde_json::json!({ "products": items }),
                    other => other,
                };
                serde_json::from_value(v).ok().map(ShopOutput::Catalog)
            }
            GET_CART | UPDATE_CART => serde_json::from_value(value.clone())
                .ok()
                .map(ShopOutput::Cart),
            GET_ORDER_STATUS => serde_json::from_value(value.clone())
                .ok()
                .map(ShopOutput::Order),
            SEARCH_POLICIES => {
                let v = match value.clone() {
                    Value::String(answer) => {
                        serde_json::json!({ "answers": [{ "answer": answer }] })
                    }
                    Value::Array(items) => serde_json::json!({ "answers": items }),
                    other => other,
                };
                serde_json::from_value(v).ok().map(ShopOutput::Policies)
            }
            _ => None,
        };
        typed.unwrap_or(ShopOutput::Raw(value))
    }

    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_decode_double_encoded_string() {
        let once = json!({"products": [{"title": "Mug"}]}).to_string();
        let twice = Value::String(serde_json::to_string(&once).unwrap());
        let decoded = decode_payload(twice);
        assert_eq!(decoded["products"][0]["title"], "Mug");
    }

    #[test]
    fn test_plain_text_is_kept() {
        assert_eq!(decode_payload(json!("hello")), json!("hello"));
        assert_eq!(decode_payload(json!("{not json")), json!("{not json"));
    }

    #[test]
    fn test_catalog_accepts_bare_array_and_string() {
        let a = ShopOutput::decode(SEARCH_CATALOG, json!([{"title": "Mug", "price": "9.00"}]));
        let b = ShopOutput::decode(
            SEARCH_CATALOG,
            json!(r#"{"products":[{"title":"Mug","price":"9.00"}]}"#),
        );
        assert_eq!(a, b);
        match a {
            ShopOutput::Catalog(c) => assert_eq!(c.products[0].price.as_deref(), Some("9.00")),
            other => panic!("expected catalog, got {:?}", other),
        }
    }

    #[test]
    fn test_policy_plain_answer() {
        let out = ShopOutput::decode(SEARCH_POLICIES, json!("Returns within 30 days."));
        assert_eq!(out.to_value()["answers"][0]["answer"], "Returns within 30 days.");
    }

    #[test]
    fn test_unknown_shape_falls_back_to_raw() {
        let out = ShopOutput::decode(GET_ORDER_STATUS, json!({"weird": true}));
        assert_eq!(out, ShopOutput::Raw(json!({"weird": true})));
    }

    #[test]
    fn test_registry_contains_all_tools() {
        let r = shop_registry();
        for name in [SEARCH_CATALOG, GET_CART, UPDATE_CART, GET_ORDER_STATUS, SEARCH_POLICIES] {
            assert!(r.contains(name), "{name} missing");
        }
    }
}
