use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ScriptError {
    #[error("refusing to render {script}: value for {placeholder} {reason}")]
    UnsafeValue {
        script: &'static str,
        placeholder: String,
        reason: &'static str,
    },

    #[error("{script} has no placeholder {placeholder}")]
    UnknownPlaceholder {
        script: &'static str,
        placeholder: String,
    },

    #[error("{script} still contains an unfilled placeholder after rendering")]
    Unfilled { script: &'static str },
}

/// A bash script with `{{NAME}}` placeholders.
///
/// Substituted values must be non-empty single-line strings without single
/// quotes or NUL bytes, so a template can place them inside `'...'` and the
/// script's own syntax never depends on the value. Anything that cannot
/// meet that bar goes in as a positional parameter instead.
#[derive(Clone, Copy, Debug)]
pub struct ScriptTemplate {
    name: &'static str,
    body: &'static str,
}

impl ScriptTemplate {
    pub const fn new(name: &'static str, body: &'static str) -> Self {
        Self { name, body }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn render(&self, values: &[(&str, &str)]) -> Result<String, ScriptError> {
        let mut rendered = self.body.to_string();
        for (name, value) in values {
            let placeholder = format!("{{{{{name}}}}}");
            if !self.body.contains(&placeholder) {
                return Err(ScriptError::UnknownPlaceholder {
                    script: self.name,
                    placeholder,
                });
            }
            if let Some(reason) = unsafe_reason(value) {
                return Err(ScriptError::UnsafeValue {
                    script: self.name,
                    placeholder,
                    reason,
                });
            }
            rendered = rendered.replace(&placeholder, value);
        }
        if rendered.contains("{{") {
            return Err(ScriptError::Unfilled { script: self.name });
        }
        Ok(rendered)
    }
}

/// `None` when `value` may be placed between single quotes in a script.
fn unsafe_reason(value: &str) -> Option<&'static str> {
    if value.is_empty() {
        Some("is empty")
    } else if value.contains('\n') || value.contains('\r') {
        Some("spans multiple lines")
    } else if value.contains('\'') {
        Some("contains a single quote")
    } else if value.contains('\0') {
        Some("contains a NUL byte")
    } else {
        None
    }
}
