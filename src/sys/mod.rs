use std::io;

/// Raw access to a digitizer: 32-bit register space and the event readout buffer.
///
/// Implementations block until the transport completes or times out.
pub trait Driver {
    fn read_user(&self, addr: usize, data: &mut [u8]) -> io::Result<()>;
    fn write_user(&self, addr: usize, data: &[u8]) -> io::Result<()>;

    fn read_dma(&self, addr: usize, data: &mut [u8]) -> io::Result<()>;
}

pub mod sim;
