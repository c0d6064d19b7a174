//! IP allow-list applied to connector `/register` and `/deregister` requests.

use std::collections::HashSet;

use parking_lot::RwLock;

/// `None` means "no allow-list configured", i.e. every IP is valid.
pub struct IpValidator {
    allow_list: RwLock<Option<HashSet<String>>>,
}

impl Default for IpValidator {
    fn default() -> Self {
        Self {
            allow_list: RwLock::new(None),
        }
    }
}

impl IpValidator {
    pub fn new(allow_list: Option<Vec<String>>) -> Self {
        Self {
            allow_list: RwLock::new(allow_list.map(|ips| ips.into_iter().collect())),
        }
    }

    pub fn is_valid(&self, ip: &str) -> bool {
        match &*self.allow_list.read() {
            None => true,
            Some(set) => set.contains(ip),
        }
    }

    pub fn update_allow_list(&self, ips: Vec<String>) {
        *self.allow_list.write() = Some(ips.into_iter().collect());
    }

    pub fn clear_allow_list(&self) {
        *self.allow_list.write() = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allows_everything_when_unconfigured() {
        let v = IpValidator::default();
        assert!(v.is_valid("10.0.0.1"));
    }

    #[test]
    fn rejects_ips_outside_the_allow_list() {
        let v = IpValidator::new(Some(vec!["10.0.0.1".to_string()]));
        assert!(v.is_valid("10.0.0.1"));
        assert!(!v.is_valid("10.0.0.2"));
    }

    #[test]
    fn update_replaces_the_allow_list() {
        let v = IpValidator::new(Some(vec!["10.0.0.1".to_string()]));
        v.update_allow_list(vec!["10.0.0.2".to_string()]);
        assert!(!v.is_valid("10.0.0.1"));
        assert!(v.is_valid("10.0.0.2"));
    }
}
