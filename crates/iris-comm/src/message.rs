//! ---
//! iris_section: "05-networking-external-interfaces"
//! iris_subsection: "module"
//! iris_type: "source"
//! iris_scope: "code"
//! iris_description: "Batched property exchange over a messenger."
//! iris_version: "v0.0.0-prealpha"
//! iris_owner: "tbd"
//! ---
use std::marker::PhantomData;

use bytes::BytesMut;

use crate::controller::ControllerInfo;
use crate::error::{CommError, Result};
use crate::log::CommLog;
use crate::messenger::Messenger;
use crate::property::{ControllerProperty, DecodeStatus, Direction};

/// Typed handle to a property added to a [`CommMessage`].
#[derive(Debug)]
pub struct PropHandle<P> {
    index: usize,
    _marker: PhantomData<fn() -> P>,
}

/// An ordered batch of properties exchanged with one controller in one round trip.
///
/// A message is built fresh for every phase. Properties added since the last exchange
/// are encoded into a single frame by [`CommMessage::query_props`] or
/// [`CommMessage::store_props`], and responses are decoded in the order added.
pub struct CommMessage<'a> {
    messenger: &'a mut dyn Messenger,
    controller: &'a ControllerInfo,
    log: &'a dyn CommLog,
    props: Vec<Option<Box<dyn ControllerProperty>>>,
    pending: Vec<usize>,
    input: BytesMut,
    round_trips: usize,
}

impl<'a> CommMessage<'a> {
    /// Bind a message to the controller being polled.
    pub fn new(
        messenger: &'a mut dyn Messenger,
        controller: &'a ControllerInfo,
        log: &'a dyn CommLog,
    ) -> Self {
        Self {
            messenger,
            controller,
            log,
            props: Vec::new(),
            pending: Vec::new(),
            input: BytesMut::new(),
            round_trips: 0,
        }
    }

    /// Controller addressed by this message.
    pub fn controller(&self) -> &ControllerInfo {
        self.controller
    }

    /// Round trips performed so far.
    pub fn round_trips(&self) -> usize {
        self.round_trips
    }

    /// Queue a property for the next exchange.
    pub fn add<P: ControllerProperty>(&mut self, prop: P) -> PropHandle<P> {
        let index = self.props.len();
        self.props.push(Some(Box::new(prop)));
        self.pending.push(index);
        PropHandle {
            index,
            _marker: PhantomData,
        }
    }

    /// Borrow a property by handle.
    pub fn get<P: ControllerProperty>(&self, handle: &PropHandle<P>) -> Option<&P> {
        let prop: &dyn ControllerProperty = self.props.get(handle.index)?.as_deref()?;
        prop.as_any().downcast_ref::<P>()
    }

    /// Take ownership of a property by handle.
    pub fn take<P: ControllerProperty>(&mut self, handle: PropHandle<P>) -> Option<P> {
        let prop = self.props.get_mut(handle.index)?.take()?;
        prop.into_any().downcast::<P>().ok().map(|boxed| *boxed)
    }

    /// Read every pending property.
    pub async fn query_props(&mut self) -> Result<()> {
        self.exchange(Direction::Query).await
    }

    /// Write every pending property.
    pub async fn store_props(&mut self) -> Result<()> {
        self.exchange(Direction::Store).await
    }

    /// Query a single property and return it decoded.
    pub async fn query<P: ControllerProperty>(&mut self, prop: P) -> Result<P> {
        let handle = self.add(prop);
        self.query_props().await?;
        self.take(handle)
            .ok_or_else(|| CommError::Parsing("property lost during exchange".into()))
    }

    /// Store a single property and return it after the acknowledgement is decoded.
    pub async fn store<P: ControllerProperty>(&mut self, prop: P) -> Result<P> {
        let handle = self.add(prop);
        self.store_props().await?;
        self.take(handle)
            .ok_or_else(|| CommError::Parsing("property lost during exchange".into()))
    }

    /// Discard stale input on both sides of the transport.
    pub async fn drain(&mut self) -> Result<()> {
        self.input.clear();
        self.messenger.drain().await
    }

    async fn exchange(&mut self, direction: Direction) -> Result<()> {
        let batch = std::mem::take(&mut self.pending);
        if batch.is_empty() {
            return Ok(());
        }
        let ctl = self.controller;
        let mut frame = BytesMut::new();
        for &index in &batch {
            let prop = self.slot(index)?;
            if !prop.supports(direction) {
                return Err(prop.unsupported(direction));
            }
            match direction {
                Direction::Query => prop.encode_query(ctl, &mut frame)?,
                Direction::Store => prop.encode_store(ctl, &mut frame)?,
            }
        }
        self.log.frame("SEND", ctl, &frame);
        self.messenger.send(ctl, &frame).await?;
        self.round_trips += 1;

        for &index in &batch {
            loop {
                if !self.input.is_empty() {
                    let prop = self.props[index]
                        .as_deref_mut()
                        .ok_or_else(|| CommError::Parsing("property taken mid-exchange".into()))?;
                    let status = match direction {
                        Direction::Query => prop.decode_query(ctl, &mut self.input)?,
                        Direction::Store => prop.decode_store(ctl, &mut self.input)?,
                    };
                    if status == DecodeStatus::Complete {
                        break;
                    }
                }
                let start = self.input.len();
                self.messenger.recv(ctl, &mut self.input).await?;
                self.log.frame("RECV", ctl, &self.input[start..]);
            }
        }
        Ok(())
    }

    fn slot(&self, index: usize) -> Result<&dyn ControllerProperty> {
        self.props
            .get(index)
            .and_then(|slot| slot.as_deref())
            .ok_or_else(|| CommError::Parsing("property taken before exchange".into()))
    }
}
