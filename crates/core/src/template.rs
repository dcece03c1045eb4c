use std::collections::BTreeMap;

/// Values substituted into `{name}` placeholders of configured commands.
#[derive(Debug, Clone, Default)]
pub struct Vars {
    values: BTreeMap<&'static str, String>,
}

impl Vars {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, key: &'static str, value: impl Into<String>) -> Self {
        self.values.insert(key, value.into());
        self
    }

    pub fn set(&mut self, key: &'static str, value: impl Into<String>) {
        self.values.insert(key, value.into());
    }

    /// Replace every known `{key}` in `template`. Unknown placeholders, such as
    /// shell `${VAR}` expansions, are left untouched.
    pub fn render(&self, template: &str) -> String {
        let mut out = String::with_capacity(template.len());
        let mut rest = template;
        while let Some(start) = rest.find('{') {
            out.push_str(&rest[..start]);
            let after = &rest[start + 1..];
            let replaced = after.find('}').and_then(|end| {
                let key = &after[..end];
                self.values.get(key).map(|value| (value, end))
            });
            match replaced {
                Some((value, end)) => {
                    out.push_str(value);
                    rest = &after[end + 1..];
                }
                None => {
                    out.push('{');
                    rest = after;
                }
            }
        }
        out.push_str(rest);
        out
    }
}

/// Whether `template` references `{key}`.
pub fn uses(template: &str, key: &str) -> bool {
    template.contains(&format!("{{{key}}}"))
}
