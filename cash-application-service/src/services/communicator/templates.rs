//! Named message templates with required-field validation.

use service_core::error::AppError;
use std::collections::HashMap;

#[derive(Debug, Clone)]
pub struct Template {
    pub name: String,
    pub subject: String,
    pub body: String,
    pub required_fields: Vec<String>,
}

#[derive(Debug, Clone, Default)]
pub struct TemplateRegistry {
    templates: HashMap<String, Template>,
}

impl TemplateRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, template: Template) {
        self.templates.insert(template.name.clone(), template);
    }

    pub fn get(&self, name: &str) -> Option<&Template> {
        self.templates.get(name)
    }

    /// Registry with the stock cash-application templates.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register(Template {
            name: "customer_clarification".to_string(),
            subject: "Your payment {transaction_id}: allocation needs clarification".to_string(),
            body: "We received your payment of {amount} {currency}. {detail} Please reply with \
                   the invoices this payment should settle."
                .to_string(),
            required_fields: vec![
                "transaction_id".to_string(),
                "amount".to_string(),
                "currency".to_string(),
                "detail".to_string(),
            ],
        });
        registry.register(Template {
            name: "internal_alert".to_string(),
            subject: "[cash-application] transaction {transaction_id} needs attention".to_string(),
            body: "Transaction {transaction_id} ({amount} {currency}) finished as {status}. \
                   Reason: {detail}"
                .to_string(),
            required_fields: vec![
                "transaction_id".to_string(),
                "amount".to_string(),
                "currency".to_string(),
                "status".to_string(),
                "detail".to_string(),
            ],
        });
        registry.register(Template {
            name: "payment_confirmation".to_string(),
            subject: "Payment {transaction_id} applied".to_string(),
            body: "Your payment of {amount} {currency} was applied to {detail}. Thank you."
                .to_string(),
            required_fields: vec![
                "transaction_id".to_string(),
                "amount".to_string(),
                "currency".to_string(),
                "detail".to_string(),
            ],
        });
        registry
    }
}

/// Render `{field}` placeholders from the payload. Fields listed as
/// required must be present; other placeholders are left untouched.
pub fn render(
    template: &Template,
    data: &serde_json::Value,
) -> Result<(String, String), AppError> {
    for field in &template.required_fields {
        if data.get(field).is_none() {
            return Err(AppError::BadRequest(anyhow::anyhow!(
                "template '{}' requires field '{}'",
                template.name,
                field
            )));
        }
    }

    let substitute = |text: &str| -> String {
        let mut rendered = text.to_string();
        if let Some(object) = data.as_object() {
            for (key, value) in object {
                let placeholder = format!("{{{}}}", key);
                let replacement = match value {
                    serde_json::Value::String(s) => s.clone(),
                    other => other.to_string(),
                };
                rendered = rendered.replace(&placeholder, &replacement);
            }
        }
        rendered
    };

    Ok((substitute(&template.subject), substitute(&template.body)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn renders_placeholders() {
        let registry = TemplateRegistry::with_defaults();
        let template = registry.get("payment_confirmation").unwrap();
        let (subject, body) = render(
            template,
            &json!({
                "transaction_id": "TXN-1",
                "amount": "100.00",
                "currency": "EUR",
                "detail": "INV-1",
            }),
        )
        .unwrap();

        assert_eq!(subject, "Payment TXN-1 applied");
        assert!(body.contains("100.00 EUR"));
        assert!(body.contains("INV-1"));
    }

    #[test]
    fn missing_required_field_is_rejected() {
        let registry = TemplateRegistry::with_defaults();
        let template = registry.get("internal_alert").unwrap();
        let result = render(template, &json!({"transaction_id": "TXN-1"}));
        assert!(result.is_err());
    }

    #[test]
    fn non_string_values_are_rendered() {
        let template = Template {
            name: "t".to_string(),
            subject: "count {n}".to_string(),
            body: "{n}".to_string(),
            required_fields: vec!["n".to_string()],
        };
        let (subject, _) = render(&template, &json!({"n": 3})).unwrap();
        assert_eq!(subject, "count 3");
    }
}
