//! ---
//! iris_section: "11-simulation"
//! iris_subsection: "module"
//! iris_type: "source"
//! iris_scope: "code"
//! iris_description: "Simulated relay boards behind a mem:// link."
//! iris_version: "v0.0.0-prealpha"
//! iris_owner: "tbd"
//! ---
use std::collections::HashSet;

use chrono::{SecondsFormat, Utc};
use indexmap::IndexMap;
use iris_comm::{ControllerInfo, Reply, Responder};
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

#[derive(Debug, Clone)]
struct Board {
    serial: String,
    relays: u8,
    bits: u16,
    sensor: bool,
    count: u64,
    configured: bool,
}

#[derive(Debug, Default)]
struct State {
    boards: IndexMap<u16, Board>,
    stuck: HashSet<(u16, u8)>,
    skew_secs: i64,
}

/// Relay boards sharing one simulated line. Drops without a board never answer.
pub struct RelaySim {
    state: Mutex<State>,
    rng: Mutex<StdRng>,
}

impl RelaySim {
    /// Line without boards.
    pub fn new(seed: u64) -> Self {
        Self {
            state: Mutex::new(State::default()),
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
        }
    }

    /// Add a configured board at `drop`.
    pub fn with_board(self, drop: u16, relays: u8, sensor: bool) -> Self {
        self.state.lock().boards.insert(
            drop,
            Board {
                serial: format!("R{drop:03}"),
                relays,
                bits: 0,
                sensor,
                count: 0,
                configured: true,
            },
        );
        self
    }

    /// Make the board at `drop` demand a settings download before answering polls.
    pub fn unconfigured(self, drop: u16) -> Self {
        if let Some(board) = self.state.lock().boards.get_mut(&drop) {
            board.configured = false;
        }
        self
    }

    /// Make relay `index` of the board at `drop` ignore commands.
    pub fn stuck_relay(self, drop: u16, index: u8) -> Self {
        self.state.lock().stuck.insert((drop, index));
        self
    }

    /// Offset applied to sample stamps.
    pub fn set_clock_skew(&self, skew: chrono::Duration) {
        self.state.lock().skew_secs = skew.num_seconds();
    }

    /// Current output bitmask of the board at `drop`.
    pub fn relays(&self, drop: u16) -> Option<u16> {
        self.state.lock().boards.get(&drop).map(|board| board.bits)
    }

    /// Whether the board at `drop` received its settings.
    pub fn is_configured(&self, drop: u16) -> bool {
        self.state
            .lock()
            .boards
            .get(&drop)
            .is_some_and(|board| board.configured)
    }

    fn answer(&self, state: &mut State, drop: u16, command: &str) -> Option<String> {
        let skew = chrono::Duration::seconds(state.skew_secs);
        let stuck = &state.stuck;
        let board = state.boards.get_mut(&drop)?;
        let payload = match command {
            "ID?" => format!(
                "ID serial={} model=RB-{} version=1.4 relays={} sensor={}",
                board.serial,
                board.relays,
                board.relays,
                u8::from(board.sensor)
            ),
            "RST" => {
                board.bits = 0;
                "OK".to_owned()
            }
            "DEF" => {
                board.configured = true;
                "OK".to_owned()
            }
            _ if !board.configured => "ERR NOCFG".to_owned(),
            "RLY?" => format!("RLY {:04X}", board.bits),
            "TMP?" if board.sensor => {
                let tenths: i32 = self.rng.lock().gen_range(150..=300);
                format!("TMP {:.1}", tenths as f32 / 10.0)
            }
            "TMP?" => "TMP --".to_owned(),
            "CNT?" => {
                board.count = self.rng.lock().gen_range(0..=20);
                let stamp = (Utc::now() + skew).to_rfc3339_opts(SecondsFormat::Secs, true);
                format!("CNT {stamp},{}", board.count)
            }
            other => match parse_set(other) {
                Some((index, _)) if index >= board.relays => "ERR range".to_owned(),
                Some((index, on)) => {
                    if !stuck.contains(&(drop, index)) {
                        let mask = 1u16 << index;
                        if on {
                            board.bits |= mask;
                        } else {
                            board.bits &= !mask;
                        }
                    }
                    "OK".to_owned()
                }
                None => "ERR unknown".to_owned(),
            },
        };
        Some(format!("#{drop} {payload}\r\n"))
    }
}

fn parse_set(command: &str) -> Option<(u8, bool)> {
    let (index, value) = command.strip_prefix("RLY ")?.split_once('=')?;
    let index: u8 = index.parse().ok().filter(|index| *index < 16)?;
    match value {
        "0" => Some((index, false)),
        "1" => Some((index, true)),
        _ => None,
    }
}

impl Responder for RelaySim {
    fn respond(&self, _ctl: &ControllerInfo, request: &[u8]) -> Reply {
        let text = String::from_utf8_lossy(request);
        let mut state = self.state.lock();
        let mut out = String::new();
        for line in text.split("\r\n").filter(|line| !line.is_empty()) {
            let Some((drop, command)) = line
                .strip_prefix('@')
                .and_then(|rest| rest.split_once(' '))
                .and_then(|(drop, command)| Some((drop.parse::<u16>().ok()?, command)))
            else {
                continue;
            };
            if let Some(reply) = self.answer(&mut state, drop, command) {
                out.push_str(&reply);
            }
        }
        if out.is_empty() {
            Reply::Silent
        } else {
            Reply::Frame(out.into_bytes())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ask(sim: &RelaySim, request: &str) -> String {
        let ctl = ControllerInfo::new("relay", "line", 1);
        match sim.respond(&ctl, request.as_bytes()) {
            Reply::Frame(bytes) => String::from_utf8(bytes).unwrap(),
            other => panic!("unexpected reply {other:?}"),
        }
    }

    #[test]
    fn batched_commands_answer_in_order() {
        let sim = RelaySim::new(7).with_board(1, 8, false);
        assert_eq!(
            ask(&sim, "@1 RLY 3=1\r\n@1 RLY?\r\n@1 TMP?\r\n"),
            "#1 OK\r\n#1 RLY 0008\r\n#1 TMP --\r\n"
        );
    }

    #[test]
    fn unconfigured_board_requests_settings() {
        let sim = RelaySim::new(7).with_board(1, 8, false).unconfigured(1);
        assert_eq!(ask(&sim, "@1 RLY?\r\n"), "#1 ERR NOCFG\r\n");
        assert_eq!(ask(&sim, "@1 DEF\r\n"), "#1 OK\r\n");
        assert!(sim.is_configured(1));
    }

    #[test]
    fn missing_board_stays_silent() {
        let sim = RelaySim::new(7).with_board(1, 8, false);
        let ctl = ControllerInfo::new("relay", "line", 2);
        assert_eq!(sim.respond(&ctl, b"@2 RLY?\r\n"), Reply::Silent);
    }

    #[test]
    fn stuck_relay_ignores_commands() {
        let sim = RelaySim::new(7).with_board(1, 8, false).stuck_relay(1, 2);
        ask(&sim, "@1 RLY 2=1\r\n");
        ask(&sim, "@1 RLY 1=1\r\n");
        assert_eq!(sim.relays(1), Some(0b010));
    }
}
