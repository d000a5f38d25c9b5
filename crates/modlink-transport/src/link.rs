use std::net::Shutdown;
use std::os::unix::net::UnixStream;

use tracing::debug;

use crate::error::Result;

/// One end of an in-process duplex link.
///
/// `reader` and `writer` share one socket, so either side can read and write
/// independently from different threads.
#[derive(Debug)]
pub struct LinkEnd {
    pub reader: UnixStream,
    pub writer: UnixStream,
}

impl LinkEnd {
    /// Signal end-of-stream to the other end without dropping the reader.
    pub fn close_write(&self) -> Result<()> {
        self.writer.shutdown(Shutdown::Write)?;
        Ok(())
    }
}

/// Create a connected pair of link ends.
///
/// Used to host a module on a thread of the host process instead of a child
/// process, with the same protocol on top.
pub fn in_process_link() -> Result<(LinkEnd, LinkEnd)> {
    let (left, right) = UnixStream::pair()?;
    let host = LinkEnd {
        reader: left.try_clone()?,
        writer: left,
    };
    let module = LinkEnd {
        reader: right.try_clone()?,
        writer: right,
    };
    debug!("created in-process module link");
    Ok((host, module))
}
