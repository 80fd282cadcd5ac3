use std::net::TcpListener;

use crate::error::{CodeboxError, Result};

pub const VNC_BASE_PORT: u16 = 5900;
const VNC_DISPLAYS: u16 = 100;

/// Reserve a free localhost TCP port by binding to port 0 and releasing it.
pub fn acquire_ephemeral_port() -> Result<u16> {
    let listener = TcpListener::bind(("127.0.0.1", 0))?;
    Ok(listener.local_addr()?.port())
}

/// Find a free VNC display in 5900-5999. Returns the display number.
pub fn acquire_vnc_display() -> Result<u16> {
    (0..VNC_DISPLAYS)
        .find(|display| TcpListener::bind(("127.0.0.1", VNC_BASE_PORT + display)).is_ok())
        .ok_or_else(|| CodeboxError::vm("no free VNC port in 5900-5999"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ephemeral_port_is_bindable() {
        let port = acquire_ephemeral_port().unwrap();
        assert!(port > 0);
        assert!(TcpListener::bind(("127.0.0.1", port)).is_ok());
    }

    #[test]
    fn test_vnc_display_in_range() {
        if let Ok(display) = acquire_vnc_display() {
            assert!(display < VNC_DISPLAYS);
        }
    }
}
