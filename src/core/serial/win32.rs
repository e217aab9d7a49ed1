//! Win32 COM port backend

use std::io;
use std::sync::Arc;

use windows::core::PCWSTR;
use windows::Win32::Devices::Communication::{
    EscapeCommFunction, GetCommModemStatus, GetCommState, PurgeComm, SetCommState,
    SetCommTimeouts, SetupComm, COMMTIMEOUTS, DCB, MODEM_STATUS_FLAGS, MS_CTS_ON, NOPARITY,
    ONESTOPBIT, PURGE_RXCLEAR, PURGE_TXCLEAR, SETDTR,
};
use windows::Win32::Foundation::{CloseHandle, GENERIC_READ, GENERIC_WRITE, HANDLE};
use windows::Win32::Storage::FileSystem::{
    CreateFileW, ReadFile, WriteFile, FILE_FLAGS_AND_ATTRIBUTES, FILE_SHARE_MODE, OPEN_EXISTING,
};
use windows::Win32::System::IO::CancelIoEx;

use super::{PortOpener, PortSettings, Result, SerialError, SerialPort};

/// Driver receive queue size in bytes
const INPUT_QUEUE: u32 = 350;
/// Driver transmit queue size in bytes
const OUTPUT_QUEUE: u32 = 20;
/// Total timeout for a single write
const WRITE_TIMEOUT_MS: u32 = 5000;

// DCB bitfield flags
const DCB_BINARY: u32 = 1 << 0;
const DCB_OUTX_CTS_FLOW: u32 = 1 << 2;
const DCB_TX_CONTINUE_ON_XOFF: u32 = 1 << 7;

/// Reads return at once with whatever is buffered, possibly nothing.
///
/// The handle is synchronous, so a pending read would hold up every write
/// and modem status query until a byte arrived. The reader thread sleeps
/// between empty reads instead.
fn comm_timeouts() -> COMMTIMEOUTS {
    COMMTIMEOUTS {
        ReadIntervalTimeout: u32::MAX,
        ReadTotalTimeoutMultiplier: 0,
        ReadTotalTimeoutConstant: 0,
        WriteTotalTimeoutMultiplier: 0,
        WriteTotalTimeoutConstant: WRITE_TIMEOUT_MS,
    }
}

fn os_error(e: windows::core::Error) -> io::Error {
    io::Error::from_raw_os_error(e.code().0 & 0xFFFF)
}

fn configure(step: &'static str) -> impl FnOnce(windows::core::Error) -> SerialError {
    move |e| SerialError::Configure {
        step,
        source: os_error(e),
    }
}

/// Opens `COMn` devices through `CreateFileW`
#[derive(Debug, Default)]
pub struct ComPortOpener;

impl PortOpener for ComPortOpener {
    fn open(&self, settings: &PortSettings) -> Result<Arc<dyn SerialPort>> {
        let port = ComPort::open(settings)?;
        Ok(Arc::new(port))
    }
}

/// Open COM port handle
pub struct ComPort {
    handle: HANDLE,
}

// Safety: the handle is only used through Win32 calls that are safe to
// issue concurrently on one file handle
unsafe impl Send for ComPort {}
unsafe impl Sync for ComPort {}

impl ComPort {
    /// Open and configure the port for 8-N-1 binary transfer
    pub fn open(settings: &PortSettings) -> Result<Self> {
        let name = settings.device_path();
        let wide: Vec<u16> = name.encode_utf16().chain(std::iter::once(0)).collect();

        let handle = unsafe {
            CreateFileW(
                PCWSTR(wide.as_ptr()),
                (GENERIC_READ | GENERIC_WRITE).0,
                FILE_SHARE_MODE(0),
                None,
                OPEN_EXISTING,
                FILE_FLAGS_AND_ATTRIBUTES(0),
                HANDLE::default(),
            )
        }
        .map_err(|e| SerialError::Open {
            name: name.clone(),
            source: os_error(e),
        })?;

        // Owns the handle from here on so every error path closes it
        let port = ComPort { handle };
        port.configure(settings)?;
        Ok(port)
    }

    fn configure(&self, settings: &PortSettings) -> Result<()> {
        unsafe {
            SetupComm(self.handle, INPUT_QUEUE, OUTPUT_QUEUE)
                .map_err(configure("set up driver queues"))?;

            let mut dcb = DCB {
                DCBlength: std::mem::size_of::<DCB>() as u32,
                ..Default::default()
            };
            GetCommState(self.handle, &mut dcb).map_err(configure("read port state"))?;

            dcb.DCBlength = std::mem::size_of::<DCB>() as u32;
            dcb.BaudRate = settings.baud;
            // DTR and RTS control disabled, no XON/XOFF, no parity check
            dcb._bitfield = DCB_BINARY | DCB_TX_CONTINUE_ON_XOFF;
            if settings.hardware_flow_control {
                dcb._bitfield |= DCB_OUTX_CTS_FLOW;
            }
            dcb.wReserved = 0;
            dcb.ByteSize = 8;
            dcb.Parity = NOPARITY;
            dcb.StopBits = ONESTOPBIT;
            SetCommState(self.handle, &dcb).map_err(configure("apply port state"))?;

            SetCommTimeouts(self.handle, &comm_timeouts()).map_err(configure("set timeouts"))?;

            PurgeComm(self.handle, PURGE_RXCLEAR | PURGE_TXCLEAR)
                .map_err(configure("purge port"))?;
            EscapeCommFunction(self.handle, SETDTR).map_err(configure("raise DTR"))?;
        }
        Ok(())
    }
}

impl SerialPort for ComPort {
    fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        let mut read: u32 = 0;
        unsafe {
            ReadFile(self.handle, Some(buf), Some(&mut read), None).map_err(os_error)?;
        }
        Ok(read as usize)
    }

    fn write_byte(&self, byte: u8) -> io::Result<()> {
        let mut written: u32 = 0;
        unsafe {
            WriteFile(self.handle, Some(&[byte]), Some(&mut written), None).map_err(os_error)?;
        }
        if written == 0 {
            return Err(io::Error::new(io::ErrorKind::TimedOut, "write timed out"));
        }
        Ok(())
    }

    fn clear_to_send(&self) -> io::Result<bool> {
        let mut status = MODEM_STATUS_FLAGS(0);
        unsafe {
            GetCommModemStatus(self.handle, &mut status).map_err(os_error)?;
        }
        Ok(status.0 & MS_CTS_ON.0 != 0)
    }

    fn cancel_read(&self) {
        unsafe {
            let _ = CancelIoEx(self.handle, None);
        }
    }

    fn purge(&self) -> io::Result<()> {
        unsafe { PurgeComm(self.handle, PURGE_RXCLEAR | PURGE_TXCLEAR).map_err(os_error) }
    }
}

impl Drop for ComPort {
    fn drop(&mut self) {
        unsafe {
            let _ = CloseHandle(self.handle);
        }
    }
}
