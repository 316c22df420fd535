//! Interface and configuration management

use crate::device::DeviceHandle;
use crate::error::{Error, Result};
use crate::sys::USBFS_DRIVER;
use nix::errno::Errno;
use protocol::EndpointAddress;
use tracing::{debug, error, warn};

impl DeviceHandle {
    /// Claim an interface for this session
    ///
    /// If another kernel driver holds the interface it is detached and the
    /// claim retried once. An interface held through usbfs belongs to
    /// another user-space program and is left alone.
    pub fn claim_interface(&mut self, interface: u8) -> Result<()> {
        let io = self.open_io()?;
        let mut detached = false;

        loop {
            match io.claim_interface(interface) {
                Ok(()) => {
                    debug!("Claimed USB interface {}", interface);
                    self.claimed.insert(interface);
                    return Ok(());
                }
                Err(Errno::EBUSY) if !detached => {
                    let driver = io.driver_name(interface).map_err(|e| {
                        error!("USB interface {} busy, driver unknown: {}", interface, e);
                        Error::InterfaceBusy {
                            interface,
                            driver: "unknown".to_string(),
                        }
                    })?;
                    warn!("USB interface {} in use by driver {}", interface, driver);

                    if driver == USBFS_DRIVER {
                        return Err(Error::InterfaceBusy { interface, driver });
                    }

                    io.disconnect_driver(interface).map_err(|e| {
                        error!("Failed to detach driver {} from USB interface {}: {}", driver, interface, e);
                        Error::os("disconnect driver", e)
                    })?;
                    debug!("Detached driver {} from USB interface {}", driver, interface);
                    self.detached.insert(interface);
                    detached = true;
                }
                Err(Errno::EBUSY) => {
                    error!("USB interface {} still busy after detaching its driver", interface);
                    let driver = io.driver_name(interface).unwrap_or_else(|_| "unknown".to_string());
                    return Err(Error::InterfaceBusy { interface, driver });
                }
                Err(e) => {
                    error!("Failed to claim USB interface {}: {}", interface, e);
                    return Err(Error::os("claim interface", e));
                }
            }
        }
    }

    /// Release a claimed interface
    ///
    /// Succeeds if the device has already gone away. A handle that is not
    /// open holds no claims, so there is nothing to release.
    pub fn release_interface(&mut self, interface: u8) -> Result<()> {
        let Some(io) = self.io.clone() else {
            debug!("USB interface {} not held by a closed handle", interface);
            return Ok(());
        };
        self.claimed.remove(&interface);

        match io.release_interface(interface) {
            Ok(()) => {
                debug!("Released USB interface {}", interface);
                Ok(())
            }
            Err(Errno::ENODEV) => {
                debug!("USB interface {} released with its device", interface);
                Ok(())
            }
            Err(e) => {
                error!("Failed to release USB interface {}: {}", interface, e);
                Err(Error::os("release interface", e))
            }
        }
    }

    pub fn set_configuration(&mut self, configuration: u8) -> Result<()> {
        let io = self.open_io()?;
        io.set_configuration(configuration).map_err(|e| {
            error!("Failed to set USB configuration {}: {}", configuration, e);
            Error::os("set configuration", e)
        })?;
        debug!("USB configuration set to {}", configuration);
        Ok(())
    }

    pub fn set_alternate(&mut self, interface: u8, alternate: u8) -> Result<()> {
        let io = self.open_io()?;
        io.set_interface(interface, alternate).map_err(|e| {
            error!(
                "Failed to set USB interface {} alternate {}: {}",
                interface, alternate, e
            );
            Error::os("set alternate setting", e)
        })?;
        debug!("USB interface {} alternate set to {}", interface, alternate);
        Ok(())
    }

    pub fn reset_device(&mut self) -> Result<()> {
        let io = self.open_io()?;
        io.reset().map_err(|e| {
            error!("Failed to reset USB device: {}", e);
            Error::os("reset device", e)
        })?;
        debug!("Reset USB device {}", self.host.usbfs_path().display());
        Ok(())
    }

    pub fn clear_halt(&mut self, endpoint: EndpointAddress) -> Result<()> {
        let io = self.open_io()?;
        io.clear_halt(endpoint.0).map_err(|e| {
            error!("Failed to clear halt on endpoint {}: {}", endpoint, e);
            Error::os("clear halt", e)
        })?;
        debug!("Cleared halt on endpoint {}", endpoint);
        Ok(())
    }

    /// Interfaces currently claimed through this handle
    pub fn claimed_interfaces(&self) -> impl Iterator<Item = u8> + '_ {
        self.claimed.iter().copied()
    }
}
