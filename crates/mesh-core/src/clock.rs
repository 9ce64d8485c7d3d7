use std::time::{SystemTime, UNIX_EPOCH};

/// Wall-clock seconds with sub-second resolution (spec §3: `ts`).
pub fn now_secs() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs_f64()
}

#[cfg(test)]
mod tests {
    use super::now_secs;

    #[test]
    fn now_is_monotonically_nondecreasing_across_calls() {
        let a = now_secs();
        let b = now_secs();
        assert!(b >= a);
    }
}
