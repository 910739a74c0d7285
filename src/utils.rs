/*
 * Gaia - greenhouse automation engine
 * Copyright (c) 2023-2026  Gaia Contributors
 *
 * This program is free software: you can redistribute it and/or modify
 * it under the terms of the GNU General Public License as published by
 * the Free Software Foundation, either version 3 of the License, or
 * (at your option) any later version.
 *
 * This program is distributed in the hope that it will be useful,
 * but WITHOUT ANY WARRANTY; without even the implied warranty of
 * MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
 * GNU General Public License for more details.
 *
 * You should have received a copy of the GNU General Public License
 * along with this program.  If not, see <https://www.gnu.org/licenses/>.
 */

use chrono::NaiveTime;
use rand::distributions::Alphanumeric;
use rand::Rng;
use sha2::{Digest, Sha256};

/// Whether `now` falls in `[start, end)`, handling spans that wrap around
/// midnight (`start > end`).
pub fn is_time_between(start: NaiveTime, end: NaiveTime, now: NaiveTime) -> bool {
    if start <= end {
        start <= now && now < end
    } else {
        now >= start || now < end
    }
}

/// A fresh base62 identifier, as used for ecosystem (8 chars) and hardware
/// (16 chars) UIDs.
pub fn generate_uid(length: usize) -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(length)
        .map(char::from)
        .collect()
}

pub fn is_valid_uid(uid: &str, length: usize) -> bool {
    uid.len() == length && uid.chars().all(|c| c.is_ascii_alphanumeric())
}

/// How long until the next local occurrence of `time`. Today if still
/// ahead, tomorrow otherwise.
pub fn duration_until_next(time: NaiveTime) -> std::time::Duration {
    let now = chrono::Local::now();
    let today = now.date_naive().and_time(time);
    let next = if today > now.naive_local() {
        today
    } else {
        today + chrono::Duration::days(1)
    };
    (next - now.naive_local())
        .to_std()
        .unwrap_or(std::time::Duration::from_secs(60))
}

/// Hex digest of file contents, used by the config watcher to ignore no-op
/// writes.
pub fn content_digest(content: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(content.as_bytes());
    format!("{:x}", hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn time(h: u32, m: u32) -> NaiveTime {
        NaiveTime::from_hms_opt(h, m, 0).unwrap()
    }

    #[test]
    fn time_between_simple_span() {
        assert!(is_time_between(time(8, 0), time(20, 0), time(12, 0)));
        assert!(is_time_between(time(8, 0), time(20, 0), time(8, 0)));
        assert!(!is_time_between(time(8, 0), time(20, 0), time(20, 0)));
        assert!(!is_time_between(time(8, 0), time(20, 0), time(7, 59)));
    }

    #[test]
    fn time_between_wrapping_span() {
        assert!(is_time_between(time(20, 0), time(8, 0), time(23, 0)));
        assert!(is_time_between(time(20, 0), time(8, 0), time(3, 0)));
        assert!(!is_time_between(time(20, 0), time(8, 0), time(12, 0)));
    }

    #[test]
    fn uid_generation() {
        let uid = generate_uid(8);
        assert!(is_valid_uid(&uid, 8));
        assert!(!is_valid_uid(&uid, 16));
        assert!(!is_valid_uid("abc-1234", 8));
    }

    #[test]
    fn digest_stability() {
        assert_eq!(content_digest("abc"), content_digest("abc"));
        assert_ne!(content_digest("abc"), content_digest("abd"));
    }
}
