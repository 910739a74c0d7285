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

use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Datelike, Local, NaiveDate, NaiveTime};
use log::{debug, warn};
use serde::{Deserialize, Serialize};

const SUN_TIMES_URL: &str = "https://api.sunrise-sunset.org/json";
const FETCH_TIMEOUT: Duration = Duration::from_secs(3);

/// Sun times of one place for one day, as local wall-clock times.
///
/// All fields are `None` during polar day or night, before the polar
/// substitution of [`SunTimes::substitute_polar`] is applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SunTimes {
    pub twilight_begin: Option<NaiveTime>,
    pub sunrise: Option<NaiveTime>,
    pub sunset: Option<NaiveTime>,
    pub twilight_end: Option<NaiveTime>,
}

/// The per-place cache entry, refreshed once a day.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SunTimesCache {
    pub last_update: NaiveDate,
    pub data: SunTimes,
}

#[derive(Deserialize)]
struct SunTimesResponse {
    results: SunTimesResults,
    status: String,
}

#[derive(Deserialize)]
struct SunTimesResults {
    sunrise: String,
    sunset: String,
    civil_twilight_begin: String,
    civil_twilight_end: String,
}

/// Downloads today's sun times for the given coordinates.
///
/// The returned times are converted to the engine's local timezone. Polar
/// day/night responses come back as `None` fields.
pub async fn fetch_sun_times(latitude: f64, longitude: f64) -> Result<SunTimes> {
    debug!("Requesting sun times from sunrise-sunset.org for ({latitude}, {longitude})");
    let client = reqwest::Client::builder().timeout(FETCH_TIMEOUT).build()?;
    let response: SunTimesResponse = client
        .get(SUN_TIMES_URL)
        .query(&[
            ("lat", latitude.to_string()),
            ("lng", longitude.to_string()),
            ("formatted", "0".to_string()),
        ])
        .send()
        .await
        .with_context(|| "Requesting sun times")?
        .json()
        .await
        .with_context(|| "Deserializing sun times response")?;
    if response.status != "OK" {
        return Err(anyhow::anyhow!(
            "sunrise-sunset.org returned status '{}'",
            response.status
        ));
    }
    Ok(SunTimes {
        twilight_begin: parse_local_time(&response.results.civil_twilight_begin),
        sunrise: parse_local_time(&response.results.sunrise),
        sunset: parse_local_time(&response.results.sunset),
        twilight_end: parse_local_time(&response.results.civil_twilight_end),
    })
}

fn parse_local_time(raw: &str) -> Option<NaiveTime> {
    DateTime::parse_from_rfc3339(raw)
        .ok()
        .map(|dt| dt.with_timezone(&Local).time())
}

impl SunTimes {
    /// Replaces missing sunrise/sunset values during polar day or night with
    /// sentinel times that keep the lighting computation coherent: a polar
    /// day becomes one millisecond short of a full 24h span, a polar night
    /// one millisecond long.
    ///
    /// Returns `true` when a substitution was applied.
    pub fn substitute_polar(&mut self, latitude: f64, today: NaiveDate, place: &str) -> bool {
        if self.sunrise.is_some() && self.sunset.is_some() {
            return false;
        }
        let northern_summer = (4..=9).contains(&today.month());
        let polar_day = (northern_summer && latitude > 0.0) || (!northern_summer && latitude < 0.0);
        let day_night = if polar_day { "day" } else { "night" };
        warn!(
            "Sun times of '{place}' have no sunrise and sunset (due to polar {day_night}). \
             Replacing values to allow coherent lighting."
        );
        let midnight = NaiveTime::from_hms_opt(0, 0, 0).unwrap();
        self.sunrise = Some(midnight);
        self.sunset = if polar_day {
            // 23:59:59.999
            NaiveTime::from_hms_milli_opt(23, 59, 59, 999)
        } else {
            // 00:00:00.001
            NaiveTime::from_hms_milli_opt(0, 0, 0, 1)
        };
        true
    }

    /// The morning offset used by the `elongate` lighting method:
    /// `sunrise - civil_dawn`, or 90 minutes when civil dawn is undefined
    /// (high latitudes near the solstices).
    pub fn twilight_offset(&self) -> chrono::Duration {
        match (self.sunrise, self.twilight_begin) {
            (Some(sunrise), Some(dawn)) if sunrise >= dawn => sunrise - dawn,
            _ => chrono::Duration::minutes(90),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn time(h: u32, m: u32) -> NaiveTime {
        NaiveTime::from_hms_opt(h, m, 0).unwrap()
    }

    #[test]
    fn polar_day_substitution() {
        let mut sun_times = SunTimes::default();
        let solstice = NaiveDate::from_ymd_opt(2025, 6, 21).unwrap();
        assert!(sun_times.substitute_polar(78.0, solstice, "svalbard"));
        assert_eq!(sun_times.sunrise, NaiveTime::from_hms_opt(0, 0, 0));
        assert_eq!(sun_times.sunset, NaiveTime::from_hms_milli_opt(23, 59, 59, 999));
    }

    #[test]
    fn polar_night_substitution() {
        let mut sun_times = SunTimes::default();
        let winter = NaiveDate::from_ymd_opt(2025, 12, 21).unwrap();
        assert!(sun_times.substitute_polar(78.0, winter, "svalbard"));
        assert_eq!(sun_times.sunset, NaiveTime::from_hms_milli_opt(0, 0, 0, 1));
    }

    #[test]
    fn no_substitution_when_complete() {
        let mut sun_times = SunTimes {
            twilight_begin: Some(time(5, 30)),
            sunrise: Some(time(6, 0)),
            sunset: Some(time(21, 0)),
            twilight_end: Some(time(21, 30)),
        };
        let date = NaiveDate::from_ymd_opt(2025, 6, 21).unwrap();
        assert!(!sun_times.substitute_polar(45.0, date, "home"));
        assert_eq!(sun_times.sunrise, Some(time(6, 0)));
    }

    #[test]
    fn twilight_offset_fallback() {
        let with_dawn = SunTimes {
            twilight_begin: Some(time(5, 30)),
            sunrise: Some(time(6, 0)),
            sunset: Some(time(21, 0)),
            twilight_end: None,
        };
        assert_eq!(with_dawn.twilight_offset(), chrono::Duration::minutes(30));

        let no_dawn = SunTimes {
            twilight_begin: None,
            sunrise: Some(time(6, 0)),
            sunset: Some(time(21, 0)),
            twilight_end: None,
        };
        assert_eq!(no_dawn.twilight_offset(), chrono::Duration::minutes(90));
    }
}
