use std::{
    collections::HashMap,
    sync::Mutex,
    time::{Duration, Instant},
};

struct Window {
    failures: u32,
    locked_until: Option<Instant>,
}

/// Per-username failed-login accounting. A locked username is rejected
/// outright, without a database lookup, until the lockout expires.
pub struct LoginThrottle {
    limit: u32,
    lockout: Duration,
    attempts: Mutex<HashMap<String, Window>>,
}

impl LoginThrottle {
    pub fn new(limit: u32, lockout: Duration) -> Self {
        Self {
            limit,
            lockout,
            attempts: Mutex::new(HashMap::new()),
        }
    }

    pub fn is_locked(&self, username: &str) -> bool {
        let mut attempts = self.attempts.lock().expect("throttle lock");
        let Some(window) = attempts.get_mut(username) else {
            return false;
        };

        match window.locked_until {
            Some(until) if until > Instant::now() => true,
            Some(_) => {
                attempts.remove(username);
                false
            }
            None => false,
        }
    }

    pub fn record_failure(&self, username: &str) {
        let mut attempts = self.attempts.lock().expect("throttle lock");
        let window = attempts.entry(username.to_string()).or_insert(Window {
            failures: 0,
            locked_until: None,
        });

        window.failures += 1;
        if window.failures >= self.limit {
            window.locked_until = Some(Instant::now() + self.lockout);
        }
    }

    pub fn record_success(&self, username: &str) {
        self.attempts.lock().expect("throttle lock").remove(username);
    }
}
