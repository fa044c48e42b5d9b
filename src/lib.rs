//! FlockRelay is the host side of two families of magnetic motion trackers.
//!
//! The older family is a flock of units chained on an RS-232 bus behind one
//! master. The [bus] session speaks its command protocol: every command is
//! one byte, optionally routed to a unit, with data and response sizes
//! taken from the [command] catalog. Records come back as packed 14 bit
//! words and are decoded into [record::Record]s, either one unit at a time
//! or all units in one group response, on request or streamed.
//!
//! The newer family streams fixed-size frames, one sub-frame per station,
//! over a serial port or a USB bulk pipe. The [liberty] session locks onto
//! the frame boundary and decodes each station's position and angles; the
//! [usb_bridge] turns the USB pipe into the same byte stream a serial port
//! gives.
//!
//! The [relay] forwards whatever either session reports to a remote host as
//! [osc] messages, with a noise gate and bump detection, and listens for
//! control messages on a local port.

#![warn(missing_docs)]
pub mod args;
pub mod bus;
pub mod byte_queue;
pub mod command;
pub mod config;
pub mod error;
pub mod liberty;
pub mod osc;
pub mod port;
pub mod record;
pub mod relay;
pub mod usb_bridge;
