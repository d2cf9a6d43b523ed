use std::collections::BTreeMap;

/// Context key naming the owning application
pub const CONTEXT_APPLICATION: &str = "medusa";
/// Value of [`CONTEXT_APPLICATION`] on every backup object
pub const CONTEXT_APPLICATION_VALUE: &str = "backup";
pub const CONTEXT_OBJECT_KEY: &str = "object_key";
pub const CONTEXT_STORAGE_PROVIDER: &str = "storage_provider";

/// Authenticated, unencrypted key/value pairs bound into a ciphertext.
///
/// Ordered so its serialized form is canonical.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EncryptionContext(BTreeMap<String, String>);

impl EncryptionContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// The context attached to a backup object stored under `object_key`.
    pub fn for_object(object_key: &str, storage_provider: &str) -> Self {
        let mut ctx = Self::new();
        ctx.insert(CONTEXT_APPLICATION, CONTEXT_APPLICATION_VALUE);
        ctx.insert(CONTEXT_OBJECT_KEY, object_key);
        ctx.insert(CONTEXT_STORAGE_PROVIDER, storage_provider);
        ctx
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.0.insert(key.into(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    pub fn object_key(&self) -> Option<&str> {
        self.get(CONTEXT_OBJECT_KEY)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for EncryptionContext {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self(iter.into_iter().map(|(k, v)| (k.into(), v.into())).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_for_object_fields() {
        let ctx = EncryptionContext::for_object("a/b.db", "s3");
        assert_eq!(ctx.get("storage_provider"), Some("s3"));
        assert_eq!(ctx.get("object_key"), Some("a/b.db"));
        assert_eq!(ctx.get("medusa"), Some("backup"));
        assert_eq!(ctx.len(), 3);
    }

    #[test]
    fn test_iteration_is_sorted() {
        let ctx: EncryptionContext = [("zeta", "1"), ("alpha", "2"), ("mid", "3")]
            .into_iter()
            .collect();
        let keys: Vec<_> = ctx.iter().map(|(k, _)| k).collect();
        assert_eq!(keys, ["alpha", "mid", "zeta"]);
    }
}
