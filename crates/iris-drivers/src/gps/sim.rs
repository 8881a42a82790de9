//! ---
//! iris_section: "11-simulation"
//! iris_subsection: "module"
//! iris_type: "source"
//! iris_scope: "code"
//! iris_description: "Simulated NMEA GPS modems."
//! iris_version: "v0.0.0-prealpha"
//! iris_owner: "tbd"
//! ---
use chrono::Utc;
use indexmap::IndexMap;
use iris_comm::{ControllerInfo, Reply, Responder};
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use super::nmea;

#[derive(Debug, Clone, Copy)]
struct Modem {
    lat: f64,
    lon: f64,
    lock: bool,
    corrupt: bool,
}

/// GPS modems keyed by controller name; each answers `GPS?` with an RMC sentence.
pub struct GpsSim {
    modems: Mutex<IndexMap<String, Modem>>,
    rng: Mutex<StdRng>,
    wander_deg: f64,
}

impl GpsSim {
    /// Simulator whose modems wander by up to `wander_deg` per poll.
    pub fn new(seed: u64, wander_deg: f64) -> Self {
        Self {
            modems: Mutex::new(IndexMap::new()),
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
            wander_deg,
        }
    }

    /// Add a modem with a fix at `lat`/`lon`.
    pub fn with_modem(self, name: impl Into<String>, lat: f64, lon: f64) -> Self {
        self.modems.lock().insert(
            name.into(),
            Modem {
                lat,
                lon,
                lock: true,
                corrupt: false,
            },
        );
        self
    }

    /// Toggle satellite lock of a modem.
    pub fn set_lock(&self, name: &str, lock: bool) {
        if let Some(modem) = self.modems.lock().get_mut(name) {
            modem.lock = lock;
        }
    }

    /// Make a modem send sentences with a bad checksum.
    pub fn set_corrupt(&self, name: &str, corrupt: bool) {
        if let Some(modem) = self.modems.lock().get_mut(name) {
            modem.corrupt = corrupt;
        }
    }

    /// Move a modem.
    pub fn relocate(&self, name: &str, lat: f64, lon: f64) {
        if let Some(modem) = self.modems.lock().get_mut(name) {
            modem.lat = lat;
            modem.lon = lon;
        }
    }

    fn rmc(modem: &Modem) -> String {
        let time = Utc::now().format("%H%M%S%.3f");
        let date = Utc::now().format("%d%m%y");
        if !modem.lock {
            return nmea::sentence(&format!("GPRMC,{time},V,,,,,,,{date},,"));
        }
        let (lat, ns) = split_hemisphere(modem.lat, 'N', 'S');
        let (lon, ew) = split_hemisphere(modem.lon, 'E', 'W');
        let body = format!(
            "GPRMC,{time},A,{},{ns},{},{ew},0.00,0.00,{date},,",
            degrees_minutes(lat, 2),
            degrees_minutes(lon, 3)
        );
        nmea::sentence(&body)
    }
}

fn split_hemisphere(value: f64, positive: char, negative: char) -> (f64, char) {
    if value < 0.0 {
        (-value, negative)
    } else {
        (value, positive)
    }
}

fn degrees_minutes(value: f64, width: usize) -> String {
    let degrees = value.trunc();
    let minutes = (value - degrees) * 60.0;
    format!("{:0width$}{:07.4}", degrees as u32, minutes, width = width)
}

impl Responder for GpsSim {
    fn respond(&self, ctl: &ControllerInfo, request: &[u8]) -> Reply {
        if request != b"GPS?\r\n" {
            return Reply::Silent;
        }
        let mut modems = self.modems.lock();
        let Some(modem) = modems.get_mut(&ctl.name) else {
            return Reply::Silent;
        };
        if self.wander_deg > 0.0 {
            let mut rng = self.rng.lock();
            modem.lat += rng.gen_range(-self.wander_deg..=self.wander_deg);
            modem.lon += rng.gen_range(-self.wander_deg..=self.wander_deg);
        }
        let mut line = Self::rmc(modem);
        if modem.corrupt {
            line.replace_range(line.len() - 2.., "00");
            if nmea::verify(&line).is_ok() {
                line.replace_range(line.len() - 2.., "01");
            }
        }
        let mut reply = nmea::sentence("GPGSV,1,1,00");
        reply.push_str("\r\n");
        reply.push_str(&line);
        reply.push_str("\r\n");
        Reply::Frame(reply.into_bytes())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn poll(sim: &GpsSim, name: &str) -> Vec<String> {
        let ctl = ControllerInfo::new(name, "modem", 1);
        match sim.respond(&ctl, b"GPS?\r\n") {
            Reply::Frame(bytes) => String::from_utf8(bytes)
                .unwrap()
                .lines()
                .map(str::to_owned)
                .collect(),
            other => panic!("unexpected reply {other:?}"),
        }
    }

    #[test]
    fn locked_modem_reports_its_position() {
        let sim = GpsSim::new(1, 0.0).with_modem("gps-1", 44.9778, -93.2650);
        let lines = poll(&sim, "gps-1");
        let fix = nmea::parse(&lines[1]).unwrap().unwrap();
        assert!(fix.lock);
        assert!((fix.lat - 44.9778).abs() < 1e-4);
        assert!((fix.lon + 93.2650).abs() < 1e-4);
    }

    #[test]
    fn corrupt_modem_fails_checksum() {
        let sim = GpsSim::new(1, 0.0).with_modem("gps-1", 44.9778, -93.2650);
        sim.set_corrupt("gps-1", true);
        let lines = poll(&sim, "gps-1");
        assert!(matches!(
            nmea::parse(&lines[1]),
            Err(iris_comm::CommError::Checksum(_))
        ));
    }

    #[test]
    fn unknown_modem_is_silent() {
        let sim = GpsSim::new(1, 0.0);
        let ctl = ControllerInfo::new("nobody", "modem", 1);
        assert_eq!(sim.respond(&ctl, b"GPS?\r\n"), Reply::Silent);
    }
}
