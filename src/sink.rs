use std::io::{Seek, Write};

/// The output sink contract (spec §6.2): writable, seekable from the start,
/// and already sized or backed by the caller to hold the final image. The
/// compiler never owns or closes it.
pub trait Sink: Write + Seek {}

impl<T: Write + Seek> Sink for T {}
