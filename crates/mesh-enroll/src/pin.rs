use rand::Rng;

/// One outstanding enrollment window (spec §4.9). At most one exists at a
/// time; creating a new PIN replaces it.
#[derive(Debug, Clone)]
pub struct PendingEnrollment {
    pub pin: String,
    pub created_at: f64,
    pub expires_at: f64,
    pub attempts: u32,
    pub max_attempts: u32,
    pub used: bool,
    pub locked: bool,
}

impl PendingEnrollment {
    pub fn new(pin_length: u32, max_age: f64, max_attempts: u32, now: f64) -> Self {
        let pin = random_decimal_pin(pin_length);
        Self { pin, created_at: now, expires_at: now + max_age, attempts: 0, max_attempts, used: false, locked: false }
    }

    pub fn is_expired(&self, now: f64) -> bool {
        now >= self.expires_at
    }

    /// Active iff not used, not locked, and not expired at `now`.
    pub fn is_active(&self, now: f64) -> bool {
        !self.used && !self.locked && !self.is_expired(now)
    }
}

fn random_decimal_pin(length: u32) -> String {
    let mut rng = rand::thread_rng();
    (0..length).map(|_| char::from(b'0' + rng.gen_range(0..10))).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_pin_has_requested_length_and_is_decimal() {
        let pending = PendingEnrollment::new(6, 300.0, 3, 0.0);
        assert_eq!(pending.pin.len(), 6);
        assert!(pending.pin.chars().all(|c| c.is_ascii_digit()));
    }

    #[test]
    fn active_until_used_locked_or_expired() {
        let mut pending = PendingEnrollment::new(6, 10.0, 3, 0.0);
        assert!(pending.is_active(5.0));
        assert!(!pending.is_active(10.0));
        pending.expires_at = 1000.0;
        pending.used = true;
        assert!(!pending.is_active(5.0));
        pending.used = false;
        pending.locked = true;
        assert!(!pending.is_active(5.0));
    }
}
