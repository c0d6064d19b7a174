//! Dark-launch traffic steering: a fixed set of "dark" connector IPs or
//! service routes get their own shadow queues in the farm, and gray testing
//! flips acquisition over to those shadow queues without touching normal
//! traffic.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{OnceLock, Weak};

use parking_lot::RwLock;
use regex_lite::Regex;
use tracing::info;

use crate::farm::WebsocketFarm;

/// Manages the dark-ip / dark-service sets and the gray-testing toggle.
///
/// Bound to its `WebsocketFarm` after both are constructed (the farm needs a
/// reference to this manager to decide which queue a socket belongs in, and
/// this manager needs a reference back to the farm to migrate sockets when
/// the dark set changes), so the link is a [`Weak`] set once via
/// [`bind_farm`](Self::bind_farm) rather than threaded through the
/// constructor.
pub struct DarkLaunchManager {
    current_ips: RwLock<HashSet<String>>,
    current_services: RwLock<HashSet<String>>,
    gray_testing: AtomicBool,
    farm: OnceLock<Weak<WebsocketFarm>>,
}

impl Default for DarkLaunchManager {
    fn default() -> Self {
        Self {
            current_ips: RwLock::new(HashSet::new()),
            current_services: RwLock::new(HashSet::new()),
            gray_testing: AtomicBool::new(false),
            farm: OnceLock::new(),
        }
    }
}

impl DarkLaunchManager {
    pub fn bind_farm(&self, farm: Weak<WebsocketFarm>) {
        let _ = self.farm.set(farm);
    }

    fn farm(&self) -> Option<std::sync::Arc<WebsocketFarm>> {
        self.farm.get().and_then(Weak::upgrade)
    }

    pub fn ip_list(&self) -> Vec<String> {
        self.current_ips.read().iter().cloned().collect()
    }

    pub fn service_list(&self) -> Vec<String> {
        self.current_services.read().iter().cloned().collect()
    }

    pub fn is_dark_mode_on(&self) -> bool {
        !self.current_ips.read().is_empty() || !self.current_services.read().is_empty()
    }

    pub fn contains_ip(&self, ip: &str) -> bool {
        self.current_ips.read().contains(ip)
    }

    pub fn contains_service(&self, service: &str) -> bool {
        self.current_services.read().contains(service)
    }

    pub fn is_gray_testing_on(&self) -> bool {
        self.gray_testing.load(Ordering::Acquire)
    }

    pub fn turn_gray_testing_on(&self, reason: &str) {
        info!(reason, "turning gray testing on");
        self.gray_testing.store(true, Ordering::Release);
    }

    pub fn turn_gray_testing_off(&self, reason: &str) {
        info!(reason, "turning gray testing off");
        self.gray_testing.store(false, Ordering::Release);
    }

    pub fn add_ip(&self, ip: String) -> Result<(), String> {
        if !is_valid_ip(&ip) {
            return Err(format!("invalid ip address: {ip}"));
        }
        self.current_ips.write().insert(ip.clone());
        if let Some(farm) = self.farm() {
            farm.migrate_ip_to_dark(&ip);
        }
        Ok(())
    }

    pub fn remove_ip(&self, ip: &str) -> Result<(), String> {
        if !self.current_ips.write().remove(ip) {
            return Err(format!("ip: {ip} is not in current list"));
        }
        self.turn_gray_testing_off("turned off gray testing after ip revoked");
        if let Some(farm) = self.farm() {
            farm.migrate_ip_to_normal(ip);
        }
        Ok(())
    }

    pub fn add_service(&self, service: String) -> Result<(), String> {
        if !is_valid_service(&service) {
            return Err(format!("invalid service: {service}"));
        }
        self.current_services.write().insert(service.clone());
        if let Some(farm) = self.farm() {
            farm.migrate_service_to_dark(&service);
        }
        Ok(())
    }

    pub fn remove_service(&self, service: &str) -> Result<(), String> {
        if !self.current_services.write().remove(service) {
            return Err(format!("service: {service} is not in current list"));
        }
        self.turn_gray_testing_off("turned off gray testing after service revoked");
        if let Some(farm) = self.farm() {
            farm.migrate_service_to_normal(service);
        }
        Ok(())
    }
}

fn is_valid_service(service: &str) -> bool {
    Regex::new(r"^[a-zA-Z]+((-|_)?\w*)*$")
        .map(|re| re.is_match(service))
        .unwrap_or(false)
}

fn is_valid_ip(ip: &str) -> bool {
    let groups: Vec<&str> = ip.split('.').collect();
    if groups.len() != 4 {
        return false;
    }
    groups.iter().all(|g| match g.parse::<u16>() {
        Ok(n) => !g.is_empty() && n <= 255,
        Err(_) => false,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_malformed_ips() {
        assert!(!is_valid_ip(""));
        assert!(!is_valid_ip("1.2.3"));
        assert!(!is_valid_ip("1.2.3.256"));
        assert!(is_valid_ip("10.0.0.1"));
    }

    #[test]
    fn rejects_malformed_service_names() {
        assert!(is_valid_service("payments"));
        assert!(is_valid_service("payments-api_2"));
        assert!(!is_valid_service("2payments"));
        assert!(!is_valid_service(""));
    }

    #[test]
    fn dark_mode_tracks_both_sets() {
        let m = DarkLaunchManager::default();
        assert!(!m.is_dark_mode_on());
        m.add_ip("10.0.0.1".to_string()).unwrap();
        assert!(m.is_dark_mode_on());
        m.remove_ip("10.0.0.1").unwrap();
        assert!(!m.is_dark_mode_on());
    }

    #[test]
    fn removing_an_absent_ip_is_an_error() {
        let m = DarkLaunchManager::default();
        assert!(m.remove_ip("10.0.0.9").is_err());
    }
}
