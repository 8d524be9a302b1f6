//! Identity registry for names.
//!
//! Form names and property names arrive from many places (API calls,
//! decoded log records, remote impulses). Each independently decoded copy
//! would otherwise be its own allocation. `OneRef` hands back one shared
//! `Arc<str>` per distinct string.

use std::sync::Arc;

use hashbrown::HashSet;
use parking_lot::Mutex;

#[derive(Debug, Default)]
pub struct OneRef {
    names: Mutex<HashSet<Arc<str>>>,
}

impl OneRef {
    pub fn new() -> Self {
        Self::default()
    }

    /// The shared instance equal to `name`, registering it on first sight.
    pub fn intern(&self, name: &str) -> Arc<str> {
        let mut names = self.names.lock();
        if let Some(existing) = names.get(name) {
            return Arc::clone(existing);
        }
        let shared: Arc<str> = Arc::from(name);
        names.insert(Arc::clone(&shared));
        shared
    }

    pub fn len(&self) -> usize {
        self.names.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_independent_strings_share_one_instance() {
        let oneref = OneRef::new();
        let x = String::from("asdf");
        let y = String::from_utf8(b"asdf".to_vec()).unwrap();
        assert_ne!(x.as_ptr(), y.as_ptr());

        let a = oneref.intern(&x);
        let b = oneref.intern(&y);
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(oneref.len(), 1);
    }

    #[test]
    fn test_distinct_strings_stay_distinct() {
        let oneref = OneRef::new();
        let a = oneref.intern("woot");
        let b = oneref.intern("toow");
        assert!(!Arc::ptr_eq(&a, &b));
        assert_eq!(oneref.len(), 2);
    }
}
