//! ---
//! iris_section: "05-networking-external-interfaces"
//! iris_subsection: "module"
//! iris_type: "source"
//! iris_scope: "code"
//! iris_description: "ASCII relay board properties."
//! iris_version: "v0.0.0-prealpha"
//! iris_owner: "tbd"
//! ---
//! Requests are `@<drop> <command>\r\n` lines; every command is answered by one
//! `#<drop> <payload>\r\n` line. A payload of `ERR <reason>` is a negative
//! acknowledgement, and `ERR NOCFG` asks for a settings download.
use chrono::{DateTime, Utc};
use iris_comm::prelude::*;
use iris_comm::property::split_line;
use serde_json::Value;

pub(crate) const TERMINATOR: &[u8] = b"\r\n";

/// Append one addressed command line.
pub(crate) fn encode_command(ctl: &ControllerInfo, command: &str, out: &mut BytesMut) {
    out.extend_from_slice(format!("@{} {command}", ctl.drop).as_bytes());
    out.extend_from_slice(TERMINATOR);
}

/// Next reply payload from `ctl`, or `None` until a full line is buffered.
pub(crate) fn decode_reply(ctl: &ControllerInfo, input: &mut BytesMut) -> Result<Option<String>> {
    let Some(line) = split_line(input, TERMINATOR) else {
        return Ok(None);
    };
    let text = std::str::from_utf8(&line)
        .map_err(|_| CommError::Parsing("reply is not ascii".into()))?;
    let (addr, payload) = text
        .strip_prefix('#')
        .and_then(|rest| rest.split_once(' '))
        .ok_or_else(|| CommError::Parsing(format!("malformed reply {text:?}")))?;
    let drop: u16 = addr
        .parse()
        .map_err(|_| CommError::Parsing(format!("bad reply address {addr:?}")))?;
    if drop != ctl.drop {
        return Err(CommError::Parsing(format!(
            "reply from drop {drop}, expected {}",
            ctl.drop
        )));
    }
    match payload.strip_prefix("ERR ") {
        Some("NOCFG") => Err(CommError::SettingsRequested),
        Some(reason) => Err(CommError::Protocol(reason.to_owned())),
        None => Ok(Some(payload.to_owned())),
    }
}

fn field<'a>(payload: &'a str, tag: &str) -> Result<&'a str> {
    payload
        .strip_prefix(tag)
        .and_then(|rest| rest.strip_prefix(' '))
        .ok_or_else(|| CommError::Parsing(format!("expected {tag} reply, got {payload:?}")))
}

fn expect_ok(payload: &str) -> Result<()> {
    if payload == "OK" {
        Ok(())
    } else {
        Err(CommError::Parsing(format!("expected OK, got {payload:?}")))
    }
}

/// Board identity (`ID?`).
#[derive(Debug, Default)]
pub struct IdentityProp {
    /// Decoded identity.
    pub setup: Option<ControllerSetup>,
}

impl ControllerProperty for IdentityProp {
    fn name(&self) -> &'static str {
        "identity"
    }

    fn encode_query(&self, ctl: &ControllerInfo, out: &mut BytesMut) -> Result<()> {
        encode_command(ctl, "ID?", out);
        Ok(())
    }

    fn decode_query(&mut self, ctl: &ControllerInfo, input: &mut BytesMut) -> Result<DecodeStatus> {
        let Some(payload) = decode_reply(ctl, input)? else {
            return Ok(DecodeStatus::Incomplete);
        };
        let mut setup = ControllerSetup::default();
        for pair in field(&payload, "ID")?.split_whitespace() {
            let (key, value) = pair
                .split_once('=')
                .ok_or_else(|| CommError::Parsing(format!("bad identity field {pair:?}")))?;
            match key {
                "serial" => setup.serial = Some(value.to_owned()),
                "model" => setup.model = Some(value.to_owned()),
                "version" => setup.version = Some(value.to_owned()),
                _ => {
                    let value = value
                        .parse::<u64>()
                        .map(Value::from)
                        .unwrap_or_else(|_| Value::from(value));
                    setup.capabilities.insert(key.to_owned(), value);
                }
            }
        }
        self.setup = Some(setup);
        Ok(DecodeStatus::Complete)
    }
}

/// Relay output bitmask (`RLY?`).
#[derive(Debug, Default)]
pub struct RelayStateProp {
    /// Bit `n` set when relay `n` is energized.
    pub bits: u16,
}

impl ControllerProperty for RelayStateProp {
    fn name(&self) -> &'static str {
        "relay-state"
    }

    fn encode_query(&self, ctl: &ControllerInfo, out: &mut BytesMut) -> Result<()> {
        encode_command(ctl, "RLY?", out);
        Ok(())
    }

    fn decode_query(&mut self, ctl: &ControllerInfo, input: &mut BytesMut) -> Result<DecodeStatus> {
        let Some(payload) = decode_reply(ctl, input)? else {
            return Ok(DecodeStatus::Incomplete);
        };
        let hex = field(&payload, "RLY")?;
        self.bits = u16::from_str_radix(hex, 16)
            .map_err(|_| CommError::Parsing(format!("bad relay mask {hex:?}")))?;
        Ok(DecodeStatus::Complete)
    }
}

/// Drive one relay output (`RLY <n>=<0|1>`).
#[derive(Debug)]
pub struct RelaySetProp {
    /// Relay index.
    pub index: u8,
    /// Requested state.
    pub on: bool,
}

impl ControllerProperty for RelaySetProp {
    fn name(&self) -> &'static str {
        "relay-set"
    }

    fn supports(&self, direction: Direction) -> bool {
        direction == Direction::Store
    }

    fn encode_store(&self, ctl: &ControllerInfo, out: &mut BytesMut) -> Result<()> {
        encode_command(ctl, &format!("RLY {}={}", self.index, u8::from(self.on)), out);
        Ok(())
    }

    fn decode_store(&mut self, ctl: &ControllerInfo, input: &mut BytesMut) -> Result<DecodeStatus> {
        match decode_reply(ctl, input)? {
            Some(payload) => expect_ok(&payload).map(|_| DecodeStatus::Complete),
            None => Ok(DecodeStatus::Incomplete),
        }
    }
}

/// Cabinet temperature (`TMP?`); `TMP --` when no sensor is fitted.
#[derive(Debug, Default)]
pub struct TemperatureProp {
    /// Degrees Celsius.
    pub celsius: Option<f32>,
}

impl ControllerProperty for TemperatureProp {
    fn name(&self) -> &'static str {
        "temperature"
    }

    fn encode_query(&self, ctl: &ControllerInfo, out: &mut BytesMut) -> Result<()> {
        encode_command(ctl, "TMP?", out);
        Ok(())
    }

    fn decode_query(&mut self, ctl: &ControllerInfo, input: &mut BytesMut) -> Result<DecodeStatus> {
        let Some(payload) = decode_reply(ctl, input)? else {
            return Ok(DecodeStatus::Incomplete);
        };
        self.celsius = match field(&payload, "TMP")? {
            "--" => None,
            value => Some(
                value
                    .parse()
                    .map_err(|_| CommError::Parsing(format!("bad temperature {value:?}")))?,
            ),
        };
        Ok(DecodeStatus::Complete)
    }
}

/// Binned event counter (`CNT?` answered by `CNT <rfc3339>,<count>`).
#[derive(Debug, Default)]
pub struct CounterProp {
    /// End of the sampling bin.
    pub stamp: Option<DateTime<Utc>>,
    /// Events counted in the bin.
    pub count: u64,
}

impl ControllerProperty for CounterProp {
    fn name(&self) -> &'static str {
        "counter"
    }

    fn encode_query(&self, ctl: &ControllerInfo, out: &mut BytesMut) -> Result<()> {
        encode_command(ctl, "CNT?", out);
        Ok(())
    }

    fn decode_query(&mut self, ctl: &ControllerInfo, input: &mut BytesMut) -> Result<DecodeStatus> {
        let Some(payload) = decode_reply(ctl, input)? else {
            return Ok(DecodeStatus::Incomplete);
        };
        let body = field(&payload, "CNT")?;
        let (stamp, count) = body
            .split_once(',')
            .ok_or_else(|| CommError::Parsing(format!("bad counter sample {body:?}")))?;
        let stamp = DateTime::parse_from_rfc3339(stamp)
            .map_err(|err| CommError::Parsing(format!("bad sample stamp: {err}")))?;
        self.stamp = Some(stamp.with_timezone(&Utc));
        self.count = count
            .parse()
            .map_err(|_| CommError::Parsing(format!("bad sample count {count:?}")))?;
        Ok(DecodeStatus::Complete)
    }
}

/// Parameterless command acknowledged with `OK` (`RST`, `DEF`).
#[derive(Debug)]
pub struct CommandProp {
    /// Command word.
    pub command: &'static str,
}

impl ControllerProperty for CommandProp {
    fn name(&self) -> &'static str {
        self.command
    }

    fn supports(&self, direction: Direction) -> bool {
        direction == Direction::Store
    }

    fn encode_store(&self, ctl: &ControllerInfo, out: &mut BytesMut) -> Result<()> {
        encode_command(ctl, self.command, out);
        Ok(())
    }

    fn decode_store(&mut self, ctl: &ControllerInfo, input: &mut BytesMut) -> Result<DecodeStatus> {
        match decode_reply(ctl, input)? {
            Some(payload) => expect_ok(&payload).map(|_| DecodeStatus::Complete),
            None => Ok(DecodeStatus::Incomplete),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn board() -> ControllerInfo {
        ControllerInfo::new("relay-3", "line-1", 3)
    }

    #[test]
    fn identity_collects_capabilities() {
        let mut input =
            BytesMut::from(&b"#3 ID serial=R100 model=RB-8 version=1.4 relays=8\r\n"[..]);
        let mut prop = IdentityProp::default();
        assert_eq!(
            prop.decode_query(&board(), &mut input).unwrap(),
            DecodeStatus::Complete
        );
        let setup = prop.setup.unwrap();
        assert_eq!(setup.serial.as_deref(), Some("R100"));
        assert_eq!(setup.capability_u64("relays"), Some(8));
        assert!(input.is_empty());
    }

    #[test]
    fn partial_reply_is_left_buffered() {
        let mut input = BytesMut::from(&b"#3 RLY 00"[..]);
        let mut prop = RelayStateProp::default();
        assert_eq!(
            prop.decode_query(&board(), &mut input).unwrap(),
            DecodeStatus::Incomplete
        );
        input.extend_from_slice(b"05\r\n");
        assert_eq!(
            prop.decode_query(&board(), &mut input).unwrap(),
            DecodeStatus::Complete
        );
        assert_eq!(prop.bits, 0x0005);
    }

    #[test]
    fn error_payloads_map_to_faults() {
        let mut prop = RelayStateProp::default();
        let mut nak = BytesMut::from(&b"#3 ERR busy\r\n"[..]);
        assert!(matches!(
            prop.decode_query(&board(), &mut nak),
            Err(CommError::Protocol(reason)) if reason == "busy"
        ));
        let mut nocfg = BytesMut::from(&b"#3 ERR NOCFG\r\n"[..]);
        assert!(matches!(
            prop.decode_query(&board(), &mut nocfg),
            Err(CommError::SettingsRequested)
        ));
        let mut stranger = BytesMut::from(&b"#4 RLY 0001\r\n"[..]);
        assert!(matches!(
            prop.decode_query(&board(), &mut stranger),
            Err(CommError::Parsing(_))
        ));
    }

    #[test]
    fn relay_set_encodes_index_and_state() {
        let mut out = BytesMut::new();
        RelaySetProp { index: 2, on: true }
            .encode_store(&board(), &mut out)
            .unwrap();
        assert_eq!(&out[..], b"@3 RLY 2=1\r\n");
        assert!(!RelaySetProp { index: 2, on: true }.supports(Direction::Query));
    }

    #[test]
    fn counter_sample_carries_stamp() {
        let mut input = BytesMut::from(&b"#3 CNT 2026-10-14T12:00:00Z,42\r\n"[..]);
        let mut prop = CounterProp::default();
        prop.decode_query(&board(), &mut input).unwrap();
        assert_eq!(prop.count, 42);
        assert_eq!(
            prop.stamp.unwrap().to_rfc3339(),
            "2026-10-14T12:00:00+00:00"
        );
    }

    #[test]
    fn missing_sensor_reads_as_none() {
        let mut input = BytesMut::from(&b"#3 TMP --\r\n"[..]);
        let mut prop = TemperatureProp::default();
        prop.decode_query(&board(), &mut input).unwrap();
        assert_eq!(prop.celsius, None);
    }
}
