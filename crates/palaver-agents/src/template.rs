use chrono::{DateTime, Local};

/// Values for the fixed set of prompt slots.
#[derive(Debug, Clone)]
pub struct TemplateSlots {
    pub bot_name: String,
    pub bot_identity: String,
    pub user_name: String,
    pub user_identity: String,
    pub now: DateTime<Local>,
}

impl TemplateSlots {
    fn lookup(&self, slot: &str) -> Option<String> {
        let value = match slot {
            "bot_name" => self.bot_name.clone(),
            "bot_identity" => self.bot_identity.clone(),
            "user_name" => self.user_name.clone(),
            "user_identity" => self.user_identity.clone(),
            "date" => self.now.format("%Y-%m-%d").to_string(),
            "time" => self.now.format("%H:%M").to_string(),
            "datetime" => self.now.format("%Y-%m-%d %H:%M").to_string(),
            "nl" => "\n".to_string(),
            _ => return None,
        };
        Some(value)
    }
}

/// Substitute `{slot}` occurrences in one left-to-right pass. Unknown slots
/// and unbalanced braces are copied through unchanged, and substituted
/// values are never rescanned.
pub fn render(template: &str, slots: &TemplateSlots) -> String {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;

    while let Some(open) = rest.find('{') {
        out.push_str(&rest[..open]);
        let after = &rest[open + 1..];

        match after.find(['{', '}']) {
            Some(close) if after.as_bytes()[close] == b'}' => {
                let name = &after[..close];
                match slots.lookup(name) {
                    Some(value) => out.push_str(&value),
                    None => {
                        out.push('{');
                        out.push_str(name);
                        out.push('}');
                    }
                }
                rest = &after[close + 1..];
            }
            _ => {
                out.push('{');
                rest = after;
            }
        }
    }

    out.push_str(rest);
    out
}

/// Render a reminder turn, which is always labelled as such for the model.
pub fn render_reminder(template: &str, slots: &TemplateSlots) -> String {
    format!("Reminder: {}", render(template, slots))
}

/// Text standing in for `{user_identity}` when the user never described
/// themselves.
pub fn identity_nudge(user_name: &str) -> String {
    format!(
        "{user_name} has not described themselves yet; if it fits, invite them to set an identity."
    )
}
