//! OpenAI-compatible model listing types.

use serde::{Deserialize, Serialize};

/// One servable model as reported by `/v1/models`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelCard {
    pub id: String,
    pub object: String,
    pub created: i64,
    pub owned_by: String,
    pub root: String,
    #[serde(default)]
    pub parent: Option<String>,
    pub max_model_len: u32,
    #[serde(default)]
    pub permission: Vec<serde_json::Value>,
}

impl ModelCard {
    pub fn new(
        id: String,
        root: String,
        max_model_len: u32,
        owned_by: String,
        parent: Option<String>,
        created: i64,
    ) -> Self {
        Self {
            id,
            object: "model".to_string(),
            created,
            owned_by,
            root,
            parent,
            max_model_len,
            permission: vec![],
        }
    }
}

/// `{"object": "list", "data": [...]}` envelope for multi-model deployments.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelList {
    pub object: String,
    pub data: Vec<ModelCard>,
}

impl ModelList {
    pub fn new(data: Vec<ModelCard>) -> Self {
        Self {
            object: "list".to_string(),
            data,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_model_card_serialization() {
        let card = ModelCard::new(
            "Qwen/Qwen2.5-1.5B-Instruct".to_string(),
            "/models/qwen".to_string(),
            32768,
            "llm-serve".to_string(),
            None,
            1_700_000_000,
        );
        let json = serde_json::to_value(&card).unwrap();
        assert_eq!(json["id"], "Qwen/Qwen2.5-1.5B-Instruct");
        assert_eq!(json["object"], "model");
        assert_eq!(json["root"], "/models/qwen");
        assert_eq!(json["max_model_len"], 32768);
        assert!(json["parent"].is_null());
    }

    #[test]
    fn test_model_list_envelope() {
        let list = ModelList::new(vec![]);
        let json = serde_json::to_string(&list).unwrap();
        assert!(json.contains(r#""object":"list""#));
        assert!(json.contains(r#""data":[]"#));
    }
}
