//! Threshold evaluation for a freshly fetched value

use crate::model::{AlarmReason, AlarmResult, InstanceConfig};
use crate::schedule::{is_active_now, LocalTime};

/// Decide whether `value` raises an alarm for `config` at `now`.
///
/// Checks run in order and the first match wins: missing value, inactive
/// day/time, no thresholds, upper limit, lower limit. Both limits are
/// inclusive and the upper limit wins when both would fire.
pub fn evaluate(value: Option<f64>, config: &InstanceConfig, now: LocalTime) -> AlarmResult {
    let Some(value) = value else {
        return AlarmResult::quiet(AlarmReason::None);
    };

    if !is_active_now(&config.active_windows, now) {
        return AlarmResult::quiet(AlarmReason::DayInactive);
    }

    if config.upper_limit.is_none() && config.lower_limit.is_none() {
        return AlarmResult::quiet(AlarmReason::NoThresholdSet);
    }

    if let Some(upper) = config.upper_limit {
        if value >= upper {
            return AlarmResult::triggered(
                AlarmReason::AboveUpper,
                format!("High: {} > {}", value, upper),
            );
        }
    }

    if let Some(lower) = config.lower_limit {
        if value <= lower {
            return AlarmResult::triggered(
                AlarmReason::BelowLower,
                format!("Low: {} < {}", value, lower),
            );
        }
    }

    AlarmResult::quiet(AlarmReason::None)
}

/// Short status text for the display surface.
pub fn status_line(result: &AlarmResult) -> &'static str {
    match result.reason {
        AlarmReason::AboveUpper | AlarmReason::BelowLower => "ALARM!",
        AlarmReason::DayInactive => "Alarm inactive today",
        AlarmReason::NoThresholdSet => "No limits set",
        AlarmReason::None => "Normal",
    }
}
