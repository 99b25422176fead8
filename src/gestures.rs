//! Gesture names (MediaPipe canned gesture classes) and their prompts.

use serde_json::Value;

/// Recognized gestures in display order, with the prompt each one triggers.
pub const GESTURE_PROMPTS: &[(&str, &str)] = &[
    ("Thumb_Up", "a peaceful forest landscape at sunrise, digital art"),
    ("Victory", "a futuristic cyberpunk city skyline at night, neon lights"),
    ("Open_Palm", "a surreal cosmic landscape with colorful nebulae and planets"),
    ("Closed_Fist", "a surreal suset in an animated world"),
    ("Pointing_Up", "a majestic castle floating in the clouds, dreamlike atmosphere"),
];

/// Confidence reported by the lenient gesture endpoint.
pub const DEFAULT_CONFIDENCE: f64 = 0.855;

/// Prompt for a gesture name. Case-sensitive, as the classifier emits it.
pub fn prompt_for(gesture: &str) -> Option<&'static str> {
    GESTURE_PROMPTS
        .iter()
        .find(|(name, _)| *name == gesture)
        .map(|(_, prompt)| *prompt)
}

pub fn gesture_names() -> impl Iterator<Item = &'static str> {
    GESTURE_PROMPTS.iter().map(|(name, _)| *name)
}

/// `Gesture '<g>' recognized successfully`
pub fn recognized_message(gesture: &str) -> String {
    format!("Gesture '{gesture}' recognized successfully")
}

/// Text form of a reported gesture value, or `None` when it is empty.
///
/// Strings are used as-is; numbers, booleans, arrays and objects render as
/// JSON. `null`, `false`, zero and empty strings or collections count as
/// missing.
pub fn gesture_label(value: &Value) -> Option<String> {
    let present = match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|n| n != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(items) => !items.is_empty(),
        Value::Object(fields) => !fields.is_empty(),
    };
    present.then(|| match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_known_gestures() {
        assert_eq!(
            prompt_for("Victory"),
            Some("a futuristic cyberpunk city skyline at night, neon lights")
        );
        assert_eq!(prompt_for("Closed_Fist"), Some("a surreal suset in an animated world"));
        assert_eq!(gesture_names().count(), 5);
    }

    #[test]
    fn test_unknown_gesture() {
        assert_eq!(prompt_for("thumb_up"), None);
        assert_eq!(prompt_for("ILoveYou"), None);
        assert_eq!(prompt_for(""), None);
    }

    #[test]
    fn test_message() {
        assert_eq!(
            recognized_message("Open_Palm"),
            "Gesture 'Open_Palm' recognized successfully"
        );
    }

    #[test]
    fn test_gesture_label() {
        use serde_json::json;
        assert_eq!(gesture_label(&json!("Victory")).as_deref(), Some("Victory"));
        assert_eq!(gesture_label(&json!(5)).as_deref(), Some("5"));
        assert_eq!(gesture_label(&json!(true)).as_deref(), Some("true"));
        assert_eq!(gesture_label(&json!(["a"])).as_deref(), Some(r#"["a"]"#));
        for missing in [json!(null), json!(""), json!(0), json!(0.0), json!(false), json!([]), json!({})] {
            assert_eq!(gesture_label(&missing), None, "{missing}");
        }
    }
}
