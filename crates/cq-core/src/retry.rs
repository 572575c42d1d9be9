/// `delay = base * 2^attempt`, clamped at `max_ms`. Used identically by the
/// Acknowledgment Tracker's ack-pickup retry and by the Processor's
/// handler-failure retry (spec §4.3 / §4.4) — one formula, two call sites.
pub fn backoff_delay_ms(base_ms: u64, attempt: u32, max_ms: u64) -> u64 {
    let scaled = base_ms.saturating_mul(1u64 << attempt.min(32));
    scaled.min(max_ms)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn doubles_per_attempt_until_clamped() {
        assert_eq!(backoff_delay_ms(100, 0, 10_000), 100);
        assert_eq!(backoff_delay_ms(100, 1, 10_000), 200);
        assert_eq!(backoff_delay_ms(100, 2, 10_000), 400);
        assert_eq!(backoff_delay_ms(100, 10, 10_000), 10_000);
    }
}
