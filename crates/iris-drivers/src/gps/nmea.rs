//! ---
//! iris_section: "05-networking-external-interfaces"
//! iris_subsection: "module"
//! iris_type: "source"
//! iris_scope: "code"
//! iris_description: "NMEA 0183 sentence validation and position parsing."
//! iris_version: "v0.0.0-prealpha"
//! iris_owner: "tbd"
//! ---
use iris_comm::{CommError, Result};
use serde::Serialize;

/// Position reported by a modem.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct GpsFix {
    /// Decimal degrees, north positive.
    pub lat: f64,
    /// Decimal degrees, east positive.
    pub lon: f64,
    /// Whether the receiver reported a usable fix.
    pub lock: bool,
}

impl GpsFix {
    /// A sentence without a usable position.
    pub fn no_lock() -> Self {
        Self {
            lat: 0.0,
            lon: 0.0,
            lock: false,
        }
    }

    /// Great-circle distance in meters.
    pub fn distance_m(&self, other: &GpsFix) -> f64 {
        const EARTH_RADIUS_M: f64 = 6_371_000.0;
        let (lat1, lat2) = (self.lat.to_radians(), other.lat.to_radians());
        let dlat = lat2 - lat1;
        let dlon = (other.lon - self.lon).to_radians();
        let a = (dlat / 2.0).sin().powi(2) + lat1.cos() * lat2.cos() * (dlon / 2.0).sin().powi(2);
        2.0 * EARTH_RADIUS_M * a.sqrt().asin()
    }
}

/// XOR of every byte between `$` and `*`.
pub fn checksum(body: &str) -> u8 {
    body.bytes().fold(0, |acc, byte| acc ^ byte)
}

/// Wrap `body` as `$<body>*<checksum>`.
pub fn sentence(body: &str) -> String {
    format!("${body}*{:02X}", checksum(body))
}

/// Strip framing from a sentence, validating the checksum when one is present.
pub fn verify(sentence: &str) -> Result<&str> {
    let start = sentence
        .find('$')
        .ok_or_else(|| CommError::Parsing(format!("not an NMEA sentence: {sentence:?}")))?;
    let framed = &sentence[start + 1..];
    let Some((body, sum)) = framed.split_once('*') else {
        return Ok(framed);
    };
    let expected = u8::from_str_radix(sum.trim(), 16)
        .map_err(|_| CommError::Parsing(format!("bad checksum field {sum:?}")))?;
    let actual = checksum(body);
    if actual != expected {
        return Err(CommError::Checksum(format!(
            "expected {expected:02X}, computed {actual:02X}"
        )));
    }
    Ok(body)
}

/// `ddmm.mmmm` / `dddmm.mmmm` to decimal degrees.
fn coordinate(value: &str, hemisphere: &str, negative: &str) -> Option<f64> {
    let dot = value.find('.').unwrap_or(value.len());
    let split = dot.checked_sub(2)?;
    let degrees: f64 = if split == 0 {
        0.0
    } else {
        value[..split].parse().ok()?
    };
    let minutes: f64 = value[split..].parse().ok()?;
    let magnitude = degrees + minutes / 60.0;
    Some(if hemisphere == negative {
        -magnitude
    } else {
        magnitude
    })
}

fn position(fields: &[&str], offset: usize) -> Option<(f64, f64)> {
    let lat = coordinate(fields.get(offset)?, fields.get(offset + 1)?, "S")?;
    let lon = coordinate(fields.get(offset + 2)?, fields.get(offset + 3)?, "W")?;
    Some((lat, lon))
}

/// Parse a `GPRMC` or `GPGGA` sentence; other sentence types yield `None`.
pub fn parse(line: &str) -> Result<Option<GpsFix>> {
    let body = verify(line)?;
    let fields: Vec<&str> = body.split(',').collect();
    let (pos_offset, locked) = match fields[0] {
        "GPRMC" => (3, fields.get(2) == Some(&"A")),
        "GPGGA" => (2, fields.get(6).is_some_and(|quality| !quality.is_empty() && *quality != "0")),
        _ => return Ok(None),
    };
    Ok(Some(match position(&fields, pos_offset) {
        Some((lat, lon)) => GpsFix {
            lat,
            lon,
            lock: locked,
        },
        None => GpsFix::no_lock(),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rmc_with_fix_parses_southern_hemisphere() {
        let fix = parse("$GPRMC,092204.999,A,4250.5589,S,14718.5084,E,0.00,89.68,211200,,*25")
            .unwrap()
            .unwrap();
        assert!(fix.lock);
        assert!((fix.lat + 42.842648).abs() < 1e-5);
        assert!((fix.lon - 147.308473).abs() < 1e-5);
    }

    #[test]
    fn rmc_without_signal_has_no_lock() {
        let fix = parse("$GPRMC,011124.00,V,,,,,,,,,,N*7A").unwrap().unwrap();
        assert_eq!(fix, GpsFix::no_lock());
    }

    #[test]
    fn corrupted_sentence_fails_checksum() {
        let err = parse("$GPRMC,092204.999,A,4250.5589,S,14718.5084,E,0.00,89.68,211200,,*26")
            .unwrap_err();
        assert!(matches!(err, CommError::Checksum(_)));
    }

    #[test]
    fn gga_quality_zero_is_unlocked() {
        let line = sentence("GPGGA,235947.000,4500.0000,N,09300.0000,W,0,00,0.0,0.0,M,,,,0000");
        let fix = parse(&line).unwrap().unwrap();
        assert!(!fix.lock);
        assert!((fix.lat - 45.0).abs() < 1e-9);
        assert!((fix.lon + 93.0).abs() < 1e-9);
    }

    #[test]
    fn other_sentences_are_skipped() {
        assert_eq!(parse(&sentence("GPGSV,1,1,00")).unwrap(), None);
    }

    #[test]
    fn distance_between_nearby_points() {
        let a = GpsFix { lat: 45.0, lon: -93.0, lock: true };
        let b = GpsFix { lat: 45.001, lon: -93.0, lock: true };
        assert!((a.distance_m(&b) - 111.2).abs() < 0.5);
    }
}
