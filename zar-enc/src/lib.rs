//! A library for writing zar archives, building on top of the
//! [`zar` crate][::zar].
//!
//! For reading archives, check the [`zar` crate][::zar] instead.
//!
//! The writer is a streaming, append-only state machine: files are declared
//! one at a time, their data is appended sequentially, and the finished
//! archive is emitted through a byte [`Sink`][sink::Sink] as a single
//! ordered stream; nothing is ever seeked or rewritten.
//!
//! ## Examples
//!
//! ```
//! use zar_enc::Writer;
//!
//! # fn work() -> zar_enc::Result<()> {
//! let mut writer = Writer::new(Vec::new())?;
//!
//! // Directories must exist before files are placed inside them.
//! writer.make_dir("assets/textures", true)?;
//!
//! // Declare a file, then stream its content in arbitrarily sized chunks.
//! writer.start_file("assets/textures/grass.dds")?;
//! writer.append(b"...texture bytes...")?;
//! writer.append(b"...more texture bytes...")?;
//!
//! // Finalizing emits the index sections and the hashed footer.
//! let archive: Vec<u8> = writer.finish()?;
//! # Ok(()) }
//! ```
#![forbid(unsafe_code)]
#![warn(missing_debug_implementations)]
#![warn(missing_docs)]

macro_rules! bail {
    ($err:expr $(,)?) => {
        return Err(Into::into($err))
    };
}

mod error;

pub mod sink;
pub mod writer;

use self::error::ErrorInner;
pub use self::error::{Error, Result};
pub use self::sink::Sink;
pub use self::writer::Writer;
