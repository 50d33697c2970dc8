use chrono::{DateTime, Duration, NaiveTime, Utc};

use crate::execution::{CloseReason, Position, TimeExitKind};
use crate::models::Direction;

/// Which exit rule fired
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitTrigger {
    Stop,
    Target,
    Time(TimeExitKind),
}

impl ExitTrigger {
    pub fn close_reason(self) -> CloseReason {
        match self {
            ExitTrigger::Stop => CloseReason::StopLoss,
            ExitTrigger::Target => CloseReason::TakeProfit,
            ExitTrigger::Time(kind) => CloseReason::TimeExit(kind),
        }
    }
}

/// Daily session boundary (UTC) at which every position must be flat
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SessionClose {
    pub close_time: NaiveTime,
    pub warning_window: Duration,
}

/// Exit rules shared by every open position
///
/// Precedence on each evaluation, first match wins:
/// stop, target, max hold, session close.
#[derive(Debug, Clone, PartialEq)]
pub struct ExitPolicy {
    max_hold: Duration,
    session: Option<SessionClose>,
}

impl ExitPolicy {
    pub fn new(max_hold: Duration) -> Self {
        Self {
            max_hold,
            session: None,
        }
    }

    /// Force exits once `now` is within `warning_window` of `close_time`
    pub fn with_session_close(mut self, close_time: NaiveTime, warning_window: Duration) -> Self {
        self.session = Some(SessionClose {
            close_time,
            warning_window,
        });
        self
    }

    pub fn max_hold(&self) -> Duration {
        self.max_hold
    }

    pub fn session(&self) -> Option<SessionClose> {
        self.session
    }

    /// Decide whether `position` must exit at `price` and time `now`
    pub fn evaluate(
        &self,
        position: &Position,
        price: f64,
        now: DateTime<Utc>,
    ) -> Option<ExitTrigger> {
        if !position.is_open() {
            return None;
        }

        // Stop before target: an ambiguous tick is the worse outcome for the holder
        if Self::stop_hit(position, price) {
            return Some(ExitTrigger::Stop);
        }

        if Self::target_hit(position, price) {
            return Some(ExitTrigger::Target);
        }

        if now - position.opened_at >= self.max_hold {
            return Some(ExitTrigger::Time(TimeExitKind::MaxHoldTimeExceeded));
        }

        if self.near_session_close(now) {
            return Some(ExitTrigger::Time(TimeExitKind::SessionClose));
        }

        None
    }

    pub fn stop_hit(position: &Position, price: f64) -> bool {
        match position.direction {
            Direction::Long => price <= position.stop_price,
            Direction::Short => price >= position.stop_price,
        }
    }

    pub fn target_hit(position: &Position, price: f64) -> bool {
        match position.direction {
            Direction::Long => price >= position.target_price,
            Direction::Short => price <= position.target_price,
        }
    }

    /// Time left until the next session close boundary
    pub fn time_until_session_close(&self, now: DateTime<Utc>) -> Option<Duration> {
        let session = self.session?;
        let today_close = now.date_naive().and_time(session.close_time).and_utc();
        let boundary = if now <= today_close {
            today_close
        } else {
            today_close + Duration::days(1)
        };
        Some(boundary - now)
    }

    fn near_session_close(&self, now: DateTime<Utc>) -> bool {
        match (self.session, self.time_until_session_close(now)) {
            (Some(session), Some(remaining)) => remaining <= session.warning_window,
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Signal;
    use crate::risk::PositionSizing;
    use chrono::TimeZone;
    use uuid::Uuid;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 2, 10, 0, 0).unwrap()
    }

    fn position(direction: Direction, stop: f64, target: f64) -> Position {
        let signal = Signal {
            id: Uuid::new_v4(),
            symbol: "SOL".to_string(),
            direction,
            entry_price: 100.0,
            stop_price: stop,
            target_price: target,
            confidence: 0.5,
            created_at: t0(),
        };
        Position::open(
            &signal,
            PositionSizing {
                size: 0.2,
                risk_amount: 1.0,
            },
            t0(),
        )
    }

    fn policy() -> ExitPolicy {
        ExitPolicy::new(Duration::hours(4))
    }

    #[test]
    fn test_long_stop_and_target() {
        let pos = position(Direction::Long, 95.0, 115.0);
        let now = t0() + Duration::minutes(5);

        assert_eq!(policy().evaluate(&pos, 94.0, now), Some(ExitTrigger::Stop));
        assert_eq!(policy().evaluate(&pos, 95.0, now), Some(ExitTrigger::Stop));
        assert_eq!(policy().evaluate(&pos, 116.0, now), Some(ExitTrigger::Target));
        assert_eq!(policy().evaluate(&pos, 105.0, now), None);
    }

    #[test]
    fn test_short_stop_and_target() {
        let pos = position(Direction::Short, 105.0, 85.0);
        let now = t0() + Duration::minutes(5);

        assert_eq!(policy().evaluate(&pos, 106.0, now), Some(ExitTrigger::Stop));
        assert_eq!(policy().evaluate(&pos, 84.0, now), Some(ExitTrigger::Target));
        assert_eq!(policy().evaluate(&pos, 99.0, now), None);
    }

    #[test]
    fn test_stop_wins_when_both_levels_satisfied() {
        // Crossed levels: 103 is both at/below the stop and at/above the target
        let pos = position(Direction::Long, 105.0, 102.0);
        let now = t0() + Duration::minutes(1);

        let trigger = policy().evaluate(&pos, 103.0, now);
        assert_eq!(trigger, Some(ExitTrigger::Stop));
        assert_eq!(trigger.map(ExitTrigger::close_reason), Some(CloseReason::StopLoss));
    }

    #[test]
    fn test_max_hold_time_exit() {
        let pos = position(Direction::Long, 95.0, 115.0);

        let before = t0() + Duration::hours(3) + Duration::minutes(59);
        assert_eq!(policy().evaluate(&pos, 102.0, before), None);

        let after = t0() + Duration::hours(4) + Duration::minutes(1);
        assert_eq!(
            policy().evaluate(&pos, 102.0, after),
            Some(ExitTrigger::Time(TimeExitKind::MaxHoldTimeExceeded))
        );
    }

    #[test]
    fn test_price_exit_beats_time_exit() {
        let pos = position(Direction::Long, 95.0, 115.0);
        let late = t0() + Duration::hours(6);

        assert_eq!(policy().evaluate(&pos, 90.0, late), Some(ExitTrigger::Stop));
    }

    #[test]
    fn test_session_close_window() {
        let policy = ExitPolicy::new(Duration::hours(12)).with_session_close(
            NaiveTime::from_hms_opt(21, 0, 0).unwrap(),
            Duration::minutes(15),
        );
        let pos = position(Direction::Long, 95.0, 115.0);
        let day = t0().date_naive();

        let early = day.and_hms_opt(20, 40, 0).unwrap().and_utc();
        assert_eq!(policy.evaluate(&pos, 101.0, early), None);

        let warning = day.and_hms_opt(20, 50, 0).unwrap().and_utc();
        assert_eq!(
            policy.evaluate(&pos, 101.0, warning),
            Some(ExitTrigger::Time(TimeExitKind::SessionClose))
        );

        let at_close = day.and_hms_opt(21, 0, 0).unwrap().and_utc();
        assert_eq!(
            policy.evaluate(&pos, 101.0, at_close),
            Some(ExitTrigger::Time(TimeExitKind::SessionClose))
        );

        // Past the boundary the next close is tomorrow
        let after = day.and_hms_opt(21, 5, 0).unwrap().and_utc();
        assert_eq!(policy.evaluate(&pos, 101.0, after), None);
        assert_eq!(
            policy.time_until_session_close(after),
            Some(Duration::hours(23) + Duration::minutes(55))
        );
    }

    #[test]
    fn test_max_hold_reported_before_session_close() {
        let policy = ExitPolicy::new(Duration::hours(4)).with_session_close(
            NaiveTime::from_hms_opt(14, 5, 0).unwrap(),
            Duration::minutes(15),
        );
        let pos = position(Direction::Long, 95.0, 115.0);

        let now = t0() + Duration::hours(4) + Duration::minutes(1);
        assert_eq!(
            policy.evaluate(&pos, 101.0, now),
            Some(ExitTrigger::Time(TimeExitKind::MaxHoldTimeExceeded))
        );
    }

    #[test]
    fn test_closed_position_never_triggers() {
        let mut pos = position(Direction::Long, 95.0, 115.0);
        pos.apply_close(96.0, CloseReason::Manual, t0(), -0.8);

        assert_eq!(policy().evaluate(&pos, 10.0, t0() + Duration::hours(9)), None);
    }
}
