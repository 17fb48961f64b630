//! Synthetic status config inserted at the head of the aggregated list.
//!
//! Owners opt in with a settings pair: an enable flag and a template whose
//! `{PLACEHOLDER}` keys render the subscriber's account state. The config
//! itself points at a dummy endpoint; clients only display its name, so a
//! subscriber sees something like "alice | 12.4 GB left | 3 days" at the
//! top of their app.

use chrono::{DateTime, Datelike, Utc};
use once_cell::sync::Lazy;
use regex::Regex;

use crate::db::LocalUser;
use crate::notifications::format_usage;

pub(crate) const PLACEHOLDER_ENABLED_KEY: &str = "subscription_placeholder_enabled";
pub(crate) const PLACEHOLDER_TEMPLATE_KEY: &str = "subscription_placeholder_template";

/// Dummy endpoint; only the percent-encoded name after `#` matters.
const PLACEHOLDER_BASE_CONFIG: &str = "ss://bm9uZTp2YWxoYWxsYQ%3D%3D@127.0.0.1:53#";

static PLACEHOLDER_KEY: Lazy<Regex> = Lazy::new(|| Regex::new(r"\{([A-Za-z0-9_]+)\}").unwrap());

/// Resolve the template against the subscriber's state and wrap it into a
/// config line. Keys are case-insensitive; unknown keys stay as written.
pub(crate) fn render(template: &str, user: &LocalUser, now: DateTime<Utc>) -> String {
    let limit = user.plan_limit_bytes;
    let used = user.used_bytes;
    let expire = user.expire_at;

    let resolved = PLACEHOLDER_KEY.replace_all(template, |caps: &regex::Captures| {
        match caps[1].to_ascii_uppercase().as_str() {
            "USERNAME" => user.username.clone(),
            "DATA_USAGE" => format_usage(used),
            "DATA_LEFT" => {
                if limit <= 0 {
                    "Unlimited".to_string()
                } else {
                    format_usage((limit - used).max(0))
                }
            }
            "DATA_LIMIT" => {
                if limit <= 0 {
                    "Unlimited".to_string()
                } else {
                    format_usage(limit)
                }
            }
            "DAYS_LEFT" => days_left(expire, now),
            "EXPIRE_DATE" => expire
                .map(|at| at.format("%Y-%m-%d").to_string())
                .unwrap_or_else(|| "Unlimited".to_string()),
            "JALALI_EXPIRE_DATE" => jalali_expire_date(expire),
            "TIME_LEFT" => time_left(expire, now),
            _ => caps[0].to_string(),
        }
    });
    format!(
        "{PLACEHOLDER_BASE_CONFIG}{}",
        urlencoding::encode(&resolved)
    )
}

fn days_left(expire: Option<DateTime<Utc>>, now: DateTime<Utc>) -> String {
    let Some(at) = expire else {
        return "Unlimited".to_string();
    };
    let seconds = (at - now).num_seconds();
    if seconds <= 0 {
        return "0".to_string();
    }
    ((seconds + 86399) / 86400).to_string()
}

fn time_left(expire: Option<DateTime<Utc>>, now: DateTime<Utc>) -> String {
    let Some(at) = expire else {
        return "Unlimited".to_string();
    };
    let seconds = (at - now).num_seconds();
    if seconds <= 0 {
        return "Expired".to_string();
    }
    let days = seconds / 86400;
    let hours = seconds % 86400 / 3600;
    let minutes = seconds % 3600 / 60;
    let mut parts = Vec::new();
    if days > 0 {
        parts.push(format!("{days} day{}", if days == 1 { "" } else { "s" }));
    }
    if hours > 0 {
        parts.push(format!("{hours} hour{}", if hours == 1 { "" } else { "s" }));
    }
    // Minutes are noise once the horizon is measured in days.
    if minutes > 0 && days == 0 {
        parts.push(format!(
            "{minutes} minute{}",
            if minutes == 1 { "" } else { "s" }
        ));
    }
    if parts.is_empty() {
        "Less than a minute".to_string()
    } else {
        parts.join(" ")
    }
}

fn jalali_expire_date(expire: Option<DateTime<Utc>>) -> String {
    let Some(at) = expire else {
        return "Unlimited".to_string();
    };
    let (jy, jm, jd) = to_jalali(at.year(), at.month() as i32, at.day() as i32);
    format!("{jy:04}-{jm:02}-{jd:02}")
}

fn to_jalali(mut gy: i32, gm: i32, gd: i32) -> (i32, i32, i32) {
    const G_D_M: [i32; 12] = [0, 31, 59, 90, 120, 151, 181, 212, 243, 273, 304, 334];
    let mut jy = if gy > 1600 {
        gy -= 1600;
        979
    } else {
        gy -= 621;
        0
    };
    let gy2 = if gm > 2 { gy + 1 } else { gy };
    let mut days = 365 * gy + (gy2 + 3) / 4 - (gy2 + 99) / 100 + (gy2 + 399) / 400 - 80
        + gd
        + G_D_M[(gm - 1) as usize];
    jy += 33 * (days / 12053);
    days %= 12053;
    jy += 4 * (days / 1461);
    days %= 1461;
    if days > 365 {
        jy += (days - 1) / 365;
        days = (days - 1) % 365;
    }
    let (jm, jd) = if days < 186 {
        (1 + days / 31, 1 + days % 31)
    } else {
        (7 + (days - 186) / 30, 1 + (days - 186) % 30)
    };
    (jy, jm, jd)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn user(limit: i64, used: i64, expire: Option<DateTime<Utc>>) -> LocalUser {
        LocalUser {
            owner_id: 1,
            username: "alice".to_string(),
            plan_limit_bytes: limit,
            used_bytes: used,
            expire_at: expire,
            manual_disabled: false,
            disabled_pushed: false,
            disabled_pushed_at: None,
            usage_limit_notified: false,
            expire_limit_notified: false,
            service_id: None,
        }
    }

    #[test]
    fn renders_known_keys_and_keeps_unknown_ones() {
        let now = Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap();
        let out = render("{username} {DATA_LEFT} {WAT}", &user(0, 0, None), now);
        let name = out.strip_prefix(PLACEHOLDER_BASE_CONFIG).unwrap();
        assert_eq!(
            urlencoding::decode(name).unwrap(),
            "alice Unlimited {WAT}"
        );
    }

    #[test]
    fn data_keys_format_bytes_when_limited() {
        let now = Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap();
        let gb = 1024 * 1024 * 1024;
        let out = render("{DATA_USAGE}/{DATA_LIMIT}", &user(10 * gb, 3 * gb, None), now);
        let name = out.strip_prefix(PLACEHOLDER_BASE_CONFIG).unwrap();
        assert_eq!(urlencoding::decode(name).unwrap(), "3.00 GB/10.00 GB");
    }

    #[test]
    fn time_left_prefers_days_and_hours() {
        let now = Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap();
        let at = now + chrono::Duration::seconds(2 * 86400 + 3 * 3600 + 20 * 60);
        assert_eq!(time_left(Some(at), now), "2 days 3 hours");
        assert_eq!(time_left(Some(now - chrono::Duration::seconds(1)), now), "Expired");
        assert_eq!(
            time_left(Some(now + chrono::Duration::seconds(30)), now),
            "Less than a minute"
        );
    }

    #[test]
    fn days_left_rounds_up() {
        let now = Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap();
        assert_eq!(days_left(Some(now + chrono::Duration::hours(25)), now), "2");
        assert_eq!(days_left(None, now), "Unlimited");
    }

    #[test]
    fn jalali_conversion_matches_known_dates() {
        assert_eq!(to_jalali(2024, 3, 20), (1403, 1, 1));
        assert_eq!(to_jalali(2026, 8, 30), (1405, 6, 8));
    }
}
