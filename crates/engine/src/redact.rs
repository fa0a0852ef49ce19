use serde_json::Value;

const REDACTED: &str = "***";

/// Scrubs known secret values out of text bound for the run summary.
#[derive(Debug, Clone, Default)]
pub(crate) struct Redactor {
    secrets: Vec<String>,
}

impl Redactor {
    pub fn new(secrets: impl IntoIterator<Item = String>) -> Self {
        let mut secrets: Vec<String> = secrets.into_iter().filter(|s| !s.trim().is_empty()).collect();
        // Longest first, so a secret containing another is replaced whole.
        secrets.sort_by(|a, b| b.len().cmp(&a.len()).then_with(|| a.cmp(b)));
        secrets.dedup();
        Self { secrets }
    }

    pub fn redact(&self, text: &str) -> String {
        self.secrets.iter().fold(text.to_string(), |text, secret| text.replace(secret.as_str(), REDACTED))
    }

    pub fn redact_value(&self, value: &mut Value) {
        match value {
            Value::String(s) => *s = self.redact(s),
            Value::Array(items) => items.iter_mut().for_each(|item| self.redact_value(item)),
            Value::Object(map) => map.values_mut().for_each(|item| self.redact_value(item)),
            _ => {},
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_redacts_every_occurrence() {
        let redactor = Redactor::new(["hunter2".to_string(), String::new(), "hunter2-extended".to_string()]);
        assert_eq!(redactor.redact("key hunter2-extended then hunter2"), "key *** then ***");
    }

    #[test]
    fn test_redacts_nested_values() {
        let redactor = Redactor::new(["tok".to_string()]);
        let mut value = json!({"movies": {"error": "bad tok"}, "list": ["tok", 3]});
        redactor.redact_value(&mut value);
        assert_eq!(value, json!({"movies": {"error": "bad ***"}, "list": ["***", 3]}));
    }
}
