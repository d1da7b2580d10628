use crate::{dap::DapMessage, dap_error::DapError};

use serde::de::Error;

use crate::dap::to_json;

use std::io::Write;

/// Unified abstraction over whatever carries the client connection
/// (stdout, a TCP stream, a test buffer).
pub trait DapTransport {
    fn send(&mut self, message: &DapMessage) -> Result<(), DapError>;
}

// Blanket impl: any `Write` is a DapTransport
impl<T: Write> DapTransport for T {
    fn send(&mut self, msg: &DapMessage) -> Result<(), DapError> {
        let json = to_json(msg)?;
        let header = format!("Content-Length: {}\r\n\r\n", json.len());
        self.write_all(header.as_bytes())
            .map_err(|e| serde_json::Error::custom(e.to_string()))?;
        self.write_all(json.as_bytes())
            .map_err(|e| serde_json::Error::custom(e.to_string()))?;
        self.flush().map_err(|e| serde_json::Error::custom(e.to_string()))?;
        log::info!("DAP -> {:?}", msg);
        Ok(())
    }
}
