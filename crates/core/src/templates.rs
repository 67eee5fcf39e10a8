//! Built-in transactional email templates.
//!
//! Templates are resolved before a job is enqueued; the queue only ever sees
//! rendered content.

use serde_json::Value;

use crate::error::JobValidationError;

/// Rendered template content.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderedTemplate {
    /// Subject line.
    pub subject: String,
    /// Plain text body.
    pub text: String,
    /// HTML body inside the shared layout.
    pub html: String,
}

/// Source of rendered content for a template id.
pub trait TemplateCatalog: Send + Sync {
    /// Render `template_id` with `data` (a JSON object of substitutions).
    fn render(&self, template_id: &str, data: &Value) -> Result<RenderedTemplate, JobValidationError>;
}

/// Identifiers of the built-in templates.
pub const BUILTIN_TEMPLATE_IDS: [&str; 6] = [
    "welcome",
    "email_verification",
    "password_reset",
    "cohort_invitation",
    "badge_awarded",
    "weekly_progress",
];

/// The platform's own transactional templates.
#[derive(Debug, Clone)]
pub struct BuiltinTemplates {
    platform_name: String,
    platform_url: String,
}

impl BuiltinTemplates {
    /// Create the catalog for a platform.
    pub fn new(platform_name: impl Into<String>, platform_url: impl Into<String>) -> Self {
        Self {
            platform_name: platform_name.into(),
            platform_url: platform_url.into().trim_end_matches('/').to_string(),
        }
    }

    /// Wrap HTML content in the shared email layout.
    fn wrap_html(&self, content: &str) -> String {
        format!(
            r#"<!DOCTYPE html>
<html>
<head>
    <meta charset="utf-8">
    <meta name="viewport" content="width=device-width, initial-scale=1.0">
    <style>
        body {{ font-family: -apple-system, BlinkMacSystemFont, 'Segoe UI', Roboto, sans-serif; line-height: 1.6; color: #333; max-width: 600px; margin: 0 auto; padding: 20px; }}
        a {{ color: #2f6fde; }}
        .button {{ display: inline-block; padding: 12px 24px; background: #2f6fde; color: #fff; text-decoration: none; border-radius: 4px; }}
    </style>
</head>
<body>
    {content}
    <hr style="margin-top: 40px; border: none; border-top: 1px solid #e9ecef;">
    <p style="font-size: 12px; color: #6c757d;">
        Sent by <a href="{url}">{name}</a>.<br>
        You can manage your email preferences in your account settings.
    </p>
</body>
</html>"#,
            url = self.platform_url,
            name = escape_html(&self.platform_name),
        )
    }

    fn button(url: &str, label: &str) -> String {
        format!(
            "<p><a class=\"button\" href=\"{}\">{label}</a></p>",
            escape_html(url)
        )
    }
}

impl TemplateCatalog for BuiltinTemplates {
    fn render(&self, template_id: &str, data: &Value) -> Result<RenderedTemplate, JobValidationError> {
        let vars = Vars { template_id, data };
        let platform = &self.platform_name;

        let (subject, text, body) = match template_id {
            "welcome" => {
                let user = vars.optional("user_name").unwrap_or_else(|| "there".to_string());
                let url = vars
                    .optional("action_url")
                    .unwrap_or_else(|| self.platform_url.clone());
                (
                    format!("Welcome to {platform}!"),
                    format!(
                        "Hi {user}!\n\nWelcome to {platform}. Your learning journey starts here.\n\nGet started: {url}"
                    ),
                    format!(
                        "<p>Hi {}!</p><p>Welcome to <strong>{}</strong>. Your learning journey starts here.</p>{}",
                        escape_html(&user),
                        escape_html(platform),
                        Self::button(&url, "Get Started")
                    ),
                )
            }

            "email_verification" => {
                let url = vars.required("action_url")?;
                let code = vars.optional("code");
                let code_text = code
                    .as_ref()
                    .map(|c| format!("\n\nOr enter this code: {c}"))
                    .unwrap_or_default();
                let code_html = code
                    .as_ref()
                    .map(|c| format!("<p>Or enter this code: <strong>{}</strong></p>", escape_html(c)))
                    .unwrap_or_default();
                (
                    format!("Verify your email for {platform}"),
                    format!(
                        "Please verify your email address for your {platform} account.\n\nVerify: {url}{code_text}"
                    ),
                    format!(
                        "<p>Please verify your email address for your {} account.</p>{}{code_html}",
                        escape_html(platform),
                        Self::button(&url, "Verify Email")
                    ),
                )
            }

            "password_reset" => {
                let url = vars.required("action_url")?;
                let expires = vars
                    .optional("expires_in_minutes")
                    .unwrap_or_else(|| "60".to_string());
                (
                    format!("Reset your {platform} password"),
                    format!(
                        "You requested a password reset for your {platform} account.\n\n\
                         Reset your password: {url}\n\n\
                         The link expires in {expires} minutes. If you didn't request this, you can ignore this email."
                    ),
                    format!(
                        "<p>You requested a password reset for your {} account.</p>{}\
                         <p><small>The link expires in {} minutes. If you didn't request this, you can ignore this email.</small></p>",
                        escape_html(platform),
                        Self::button(&url, "Reset Password"),
                        escape_html(&expires)
                    ),
                )
            }

            "cohort_invitation" => {
                let cohort = vars.required("cohort_name")?;
                let url = vars.required("action_url")?;
                let inviter = vars
                    .optional("inviter_name")
                    .unwrap_or_else(|| "An instructor".to_string());
                (
                    format!("You're invited to join {cohort}"),
                    format!("{inviter} invited you to join the cohort {cohort} on {platform}.\n\nAccept the invitation: {url}"),
                    format!(
                        "<p>{} invited you to join the cohort <strong>{}</strong> on {}.</p>{}",
                        escape_html(&inviter),
                        escape_html(&cohort),
                        escape_html(platform),
                        Self::button(&url, "Accept Invitation")
                    ),
                )
            }

            "badge_awarded" => {
                let badge = vars.required("badge_name")?;
                let user = vars.optional("user_name").unwrap_or_else(|| "there".to_string());
                let description = vars.optional("badge_description");
                let description_text = description
                    .as_ref()
                    .map(|d| format!("\n\n{d}"))
                    .unwrap_or_default();
                let description_html = description
                    .as_ref()
                    .map(|d| format!("<blockquote>{}</blockquote>", escape_html(d)))
                    .unwrap_or_default();
                (
                    format!("You earned the {badge} badge!"),
                    format!(
                        "Congratulations {user}!\n\nYou earned the {badge} badge on {platform}.{description_text}\n\nSee your badges: {}/badges",
                        self.platform_url
                    ),
                    format!(
                        "<p>Congratulations {}!</p><p>You earned the <strong>{}</strong> badge on {}.</p>{description_html}{}",
                        escape_html(&user),
                        escape_html(&badge),
                        escape_html(platform),
                        Self::button(&format!("{}/badges", self.platform_url), "See Your Badges")
                    ),
                )
            }

            "weekly_progress" => {
                let user = vars.optional("user_name").unwrap_or_else(|| "there".to_string());
                let lessons = vars
                    .optional("lessons_completed")
                    .unwrap_or_else(|| "0".to_string());
                let streak = vars.optional("streak_days");
                let streak_text = streak
                    .as_ref()
                    .map(|s| format!("\nCurrent streak: {s} days"))
                    .unwrap_or_default();
                let streak_html = streak
                    .as_ref()
                    .map(|s| format!("<p>Current streak: <strong>{}</strong> days</p>", escape_html(s)))
                    .unwrap_or_default();
                (
                    format!("Your weekly progress on {platform}"),
                    format!(
                        "Hi {user}!\n\nThis week you completed {lessons} lessons.{streak_text}\n\nKeep going: {}",
                        self.platform_url
                    ),
                    format!(
                        "<p>Hi {}!</p><p>This week you completed <strong>{}</strong> lessons.</p>{streak_html}{}",
                        escape_html(&user),
                        escape_html(&lessons),
                        Self::button(&self.platform_url, "Keep Going")
                    ),
                )
            }

            other => return Err(JobValidationError::UnknownTemplate(other.to_string())),
        };

        Ok(RenderedTemplate {
            subject,
            text,
            html: self.wrap_html(&body),
        })
    }
}

/// Field lookup over template data.
struct Vars<'a> {
    template_id: &'a str,
    data: &'a Value,
}

impl Vars<'_> {
    fn optional(&self, field: &str) -> Option<String> {
        match self.data.get(field)? {
            Value::String(s) if !s.trim().is_empty() => Some(s.clone()),
            Value::Number(n) => Some(n.to_string()),
            Value::Bool(b) => Some(b.to_string()),
            _ => None,
        }
    }

    fn required(&self, field: &'static str) -> Result<String, JobValidationError> {
        self.optional(field)
            .ok_or_else(|| JobValidationError::MissingTemplateField {
                template: builtin_id(self.template_id),
                field,
            })
    }
}

fn builtin_id(template_id: &str) -> &'static str {
    BUILTIN_TEMPLATE_IDS
        .iter()
        .copied()
        .find(|id| *id == template_id)
        .unwrap_or("unknown")
}

/// Escape text for inclusion in HTML.
#[must_use]
pub fn escape_html(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    for c in input.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            _ => out.push(c),
        }
    }
    out
}
