use chrono::NaiveDateTime;

/// Time-windowed refund policy for cancelled bookings.
///
/// The amounts are configuration; the shape (flat fee above the cutoff,
/// forfeit below it) is fixed.
#[derive(Debug, Clone, Copy)]
pub struct RefundPolicy {
    pub cutoff_hours: i64,
    pub processing_fee_cents: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefundTier {
    FullMinusFee,
    Forfeit,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RefundDecision {
    pub tier: RefundTier,
    pub refund_cents: i64,
    pub fee_cents: i64,
}

impl RefundPolicy {
    /// Evaluates the policy against the wall-clock `now` of the cancellation
    /// request. Whole hours, floored: a booking exactly at the cutoff
    /// boundary is still refund-eligible. Results must not be cached — the
    /// answer changes as the appointment approaches.
    pub fn evaluate(
        &self,
        appointment_time: NaiveDateTime,
        now: NaiveDateTime,
        deposit_cents: i64,
    ) -> RefundDecision {
        let hours_until = (appointment_time - now).num_hours();

        if hours_until >= self.cutoff_hours {
            let refund_cents = (deposit_cents - self.processing_fee_cents).max(0);
            RefundDecision {
                tier: RefundTier::FullMinusFee,
                refund_cents,
                fee_cents: deposit_cents - refund_cents,
            }
        } else {
            RefundDecision {
                tier: RefundTier::Forfeit,
                refund_cents: 0,
                fee_cents: deposit_cents,
            }
        }
    }
}
