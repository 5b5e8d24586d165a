/// Claim/release flag. A claim never queues: it either succeeds or tells the caller the slot is
/// taken.
#[derive(Debug, Default)]
pub struct SingleFlight {
    claimed: bool,
}

impl SingleFlight {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns true when the caller now owns the flag.
    pub fn check_and_claim(&mut self) -> bool {
        if self.claimed {
            return false;
        }
        self.claimed = true;
        true
    }

    pub fn release(&mut self) {
        self.claimed = false;
    }

    pub fn is_claimed(&self) -> bool {
        self.claimed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_claim_fails_until_release() {
        let mut lock = SingleFlight::new();
        assert!(lock.check_and_claim());
        assert!(!lock.check_and_claim());
        assert!(lock.is_claimed());
        lock.release();
        assert!(!lock.is_claimed());
        assert!(lock.check_and_claim());
    }

    #[test]
    fn release_is_idempotent() {
        let mut lock = SingleFlight::new();
        lock.release();
        lock.release();
        assert!(lock.check_and_claim());
    }
}
