//! Key prefixing shared by drivers and namespaces.

/// Separator between prefix segments.
pub const KEY_SEPARATOR: char = ':';

/// A (possibly empty) key prefix such as `app:users`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct KeyPrefix(Option<String>);

impl KeyPrefix {
    pub fn new(prefix: Option<&str>) -> Self {
        Self(prefix.filter(|p| !p.is_empty()).map(str::to_string))
    }

    pub fn none() -> Self {
        Self(None)
    }

    pub fn as_str(&self) -> Option<&str> {
        self.0.as_deref()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_none()
    }

    /// Fully qualified key for `key`.
    pub fn item_key(&self, key: &str) -> String {
        match &self.0 {
            Some(prefix) => format!("{prefix}{KEY_SEPARATOR}{key}"),
            None => key.to_string(),
        }
    }

    /// Prefix of a namespace nested under this prefix.
    pub fn namespace(&self, namespace: &str) -> Self {
        Self(Some(self.item_key(namespace)))
    }

    /// Strips this prefix from a fully qualified key.
    pub fn strip<'a>(&self, full_key: &'a str) -> Option<&'a str> {
        match &self.0 {
            Some(prefix) => full_key
                .strip_prefix(prefix.as_str())
                .and_then(|rest| rest.strip_prefix(KEY_SEPARATOR)),
            None => Some(full_key),
        }
    }

    /// `true` when `full_key` lives under this prefix.
    pub fn owns(&self, full_key: &str) -> bool {
        self.strip(full_key).is_some()
    }
}

/// Joins two optional namespace paths (`users` + `admins` -> `users:admins`).
pub fn join_namespace(parent: Option<&str>, child: &str) -> String {
    match parent {
        Some(parent) if !parent.is_empty() => format!("{parent}{KEY_SEPARATOR}{child}"),
        _ => child.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_item_key() {
        assert_eq!(KeyPrefix::new(Some("app")).item_key("k"), "app:k");
        assert_eq!(KeyPrefix::none().item_key("k"), "k");
        assert_eq!(KeyPrefix::new(Some("")).item_key("k"), "k");
    }

    #[test]
    fn test_namespace_composes() {
        let prefix = KeyPrefix::new(Some("app")).namespace("users").namespace("admins");
        assert_eq!(prefix.as_str(), Some("app:users:admins"));
        assert_eq!(KeyPrefix::none().namespace("users").as_str(), Some("users"));
        assert_eq!(
            KeyPrefix::new(Some("app")).namespace(&join_namespace(Some("users"), "admins")),
            prefix
        );
    }

    #[test]
    fn test_strip_and_owns() {
        let prefix = KeyPrefix::new(Some("app:users"));
        assert_eq!(prefix.strip("app:users:1"), Some("1"));
        assert!(prefix.owns("app:users:1"));
        assert!(!prefix.owns("app:usersx:1"));
        assert!(!prefix.owns("app:other:1"));
        assert!(KeyPrefix::none().owns("anything"));
    }
}
