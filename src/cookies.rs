use std::collections::BTreeMap;
use std::sync::RwLock;

/// Process-scoped cookie store shared by every request the client sends.
///
/// Reads hand out a defensive copy so callers never observe concurrent
/// upserts mid-iteration.
#[derive(Debug, Default)]
pub struct CookieJar {
    entries: RwLock<BTreeMap<String, String>>,
}

impl CookieJar {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub fn all(&self) -> BTreeMap<String, String> {
        self.read().clone()
    }

    pub fn get(&self, name: &str) -> Option<String> {
        self.read().get(name).cloned()
    }

    pub fn insert(&self, name: &str, value: &str) {
        let mut entries = match self.entries.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if entries.get(name).map(String::as_str) != Some(value) {
            entries.insert(name.to_owned(), value.to_owned());
        }
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, BTreeMap<String, String>> {
        match self.entries.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::CookieJar;

    #[test]
    fn insert_upserts_and_copies_are_defensive() {
        let jar = CookieJar::new();
        jar.insert("session", "one");
        jar.insert("session", "two");

        let mut copy = jar.all();
        copy.insert("rogue".to_owned(), "entry".to_owned());

        assert_eq!(jar.get("session").as_deref(), Some("two"));
        assert_eq!(jar.len(), 1);
        assert!(jar.get("rogue").is_none());
    }
}
