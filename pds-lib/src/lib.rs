#![doc = include_str!("../README.md")]

mod error;

pub mod modis;
pub mod spacepacket;
pub mod timecode;

pub use error::{Error, Result};
pub use spacepacket::{Apid, Packet, PrimaryHeader};
