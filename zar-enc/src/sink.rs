//! The byte-sink abstraction the writer emits through.

use std::io;

/// Destination for the serialised archive stream.
///
/// The writer announces each output part with [`Sink::begin_part`] before
/// writing any of its bytes. The part index is reserved for multi-part
/// output; the current writer emits exactly one part, announced with index
/// `-1` at construction, and then delivers every archive byte in order
/// through [`Sink::write_all`].
///
/// Any [`io::Write`] is a `Sink` whose `begin_part` is a no-op, so a
/// [`File`][std::fs::File], a [`Vec<u8>`] or a
/// [`BufWriter`][io::BufWriter] can be passed to the writer directly.
pub trait Sink {
    /// Open the output part with the given index.
    fn begin_part(&mut self, part_index: i32) -> io::Result<()>;

    /// Append a run of archive bytes to the current part.
    fn write_all(&mut self, data: &[u8]) -> io::Result<()>;
}

impl<W: io::Write + ?Sized> Sink for W {
    fn begin_part(&mut self, _part_index: i32) -> io::Result<()> {
        Ok(())
    }

    fn write_all(&mut self, data: &[u8]) -> io::Result<()> {
        io::Write::write_all(self, data)
    }
}
