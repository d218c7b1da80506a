//! 工具参数校验：按工具声明的 JSON Schema 子集检查 args
//!
//! 支持 type / properties / required / enum / additionalProperties:false，足以覆盖内置工具；
//! 不认识的关键字忽略。

use serde_json::Value;

fn type_matches(expected: &str, value: &Value) -> bool {
    match expected {
        "string" => value.is_string(),
        "integer" => value.is_i64() || value.is_u64(),
        "number" => value.is_number(),
        "boolean" => value.is_boolean(),
        "array" => value.is_array(),
        "object" => value.is_object(),
        "null" => value.is_null(),
        _ => true,
    }
}

fn check_type(schema: &Value, value: &Value, path: &str) -> Result<(), String> {
    match schema.get("type") {
        Some(Value::String(t)) if !type_matches(t, value) => {
            Err(format!("`{path}` must be of type {t}"))
        }
        Some(Value::Array(types)) => {
            let ok = types
                .iter()
                .filter_map(|t| t.as_str())
                .any(|t| type_matches(t, value));
            if ok {
                Ok(())
            } else {
                Err(format!("`{path}` has an unexpected type"))
            }
        }
        _ => Ok(()),
    }
}

/// 校验 args 是否满足 schema；返回第一处违规
pub fn validate_args(schema: &Value, args: &Value) -> Result<(), String> {
    check_type(schema, args, "args")?;
    let Some(obj) = args.as_object() else {
        return Ok(());
    };

    if let Some(required) = schema.get("required").and_then(|r| r.as_array()) {
        for field in required.iter().filter_map(|f| f.as_str()) {
            match obj.get(field) {
                None | Some(Value::Null) => return Err(format!("missing required field `{field}`")),
                _ => {}
            }
        }
    }

    let properties = schema.get("properties").and_then(|p| p.as_object());
    let closed = schema
        .get("additionalProperties")
        .and_then(|a| a.as_bool())
        .is_some_and(|allowed| !allowed);

    for (key, value) in obj {
        match properties.and_then(|p| p.get(key)) {
            Some(prop) => {
                // 可选字段显式给 null 视为未提供
                if value.is_null() {
                    continue;
                }
                check_type(prop, value, key)?;
                if let Some(options) = prop.get("enum").and_then(|e| e.as_array()) {
                    if !options.contains(value) {
                        return Err(format!("`{key}` must be one of {}", Value::Array(options.clone())));
                    }
                }
            }
            None if closed => return Err(format!("unexpected field `{key}`")),
            None => {}
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn schema() -> Value {
        json!({
            "type": "object",
            "properties": {
                "query": { "type": "string" },
                "filter_year": { "type": "integer" },
                "mode": { "type": "string", "enum": ["fast", "deep"] }
            },
            "required": ["query"],
            "additionalProperties": false
        })
    }

    #[test]
    fn test_accepts_valid_args() {
        assert!(validate_args(&schema(), &json!({"query": "x"})).is_ok());
        assert!(validate_args(&schema(), &json!({"query": "x", "filter_year": 2020, "mode": "deep"})).is_ok());
        assert!(validate_args(&schema(), &json!({"query": "x", "filter_year": null})).is_ok());
    }

    #[test]
    fn test_rejects_violations() {
        assert!(validate_args(&schema(), &json!({})).unwrap_err().contains("query"));
        assert!(validate_args(&schema(), &json!({"query": 1})).is_err());
        assert!(validate_args(&schema(), &json!({"query": "x", "filter_year": "2020"})).is_err());
        assert!(validate_args(&schema(), &json!({"query": "x", "mode": "slow"})).is_err());
        assert!(validate_args(&schema(), &json!({"query": "x", "extra": true})).is_err());
        assert!(validate_args(&schema(), &json!("query")).is_err());
    }
}
