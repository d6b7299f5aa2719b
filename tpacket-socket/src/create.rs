//! # Capture Socket Creation and Configuration
//!
//! ## Purpose
//!
//! This file contains the logic for turning a ring configuration into a bound
//! `CaptureSocket`: an `AF_PACKET` socket running `TPACKET_V3`, with its receive ring
//! registered and mapped, attached to one interface and, optionally, to a fan-out group.
//!
//! ## How it works
//!
//! `CaptureSocketBuilder::new` validates the ring before anything is opened. `bind` then
//! runs the setup sequence with `libc` syscalls:
//!
//! 1.  Resolves the interface name to an index with `if_nametoindex`.
//! 2.  Opens an `AF_PACKET` socket for all protocols.
//! 3.  Selects `TPACKET_V3` with `PACKET_VERSION`.
//! 4.  Registers the ring with `PACKET_RX_RING`.
//! 5.  Maps the ring into the process.
//! 6.  Binds the socket to the interface.
//! 7.  Adds a promiscuous membership, if requested.
//! 8.  Joins the fan-out group, if requested. The kernel only accepts this on a bound socket.
//!
//! Each resource is an owned value (`OwnedFd`, `RingMapping`) from the moment it exists, so
//! a failure at any step releases everything acquired before it. The promiscuous membership
//! belongs to the socket and goes away when it closes.
//!
//! ## Main components
//!
//! - `CaptureSocketBuilder`: validated socket parameters and the `bind` sequence.
//! - `set_option()`: a typed `setsockopt` on `SOL_PACKET`.

use crate::config::{Fanout, RingConfig, SocketKind, validate_interface_name};
use crate::error::{BindError, BindStep, ConfigError};
use crate::mmap::{RingMapping, page_size};
use crate::ring::{
    PACKET_ADD_MEMBERSHIP, PACKET_FANOUT, PACKET_MR_PROMISC, PACKET_RX_RING, PACKET_VERSION,
    PacketMreq, TPACKET_V3,
};
use crate::socket::CaptureSocket;
use caps::{CapSet, Capability};
use std::ffi::CString;
use std::io;
use std::mem::size_of;
use std::os::fd::{AsFd as _, AsRawFd as _, BorrowedFd, FromRawFd as _, OwnedFd};

/// Parameters for opening capture sockets that share one ring geometry.
///
/// A builder can bind any number of sockets; the dispatcher binds one per worker.
#[derive(Debug, Clone)]
pub struct CaptureSocketBuilder {
    kind: SocketKind,
    ring: RingConfig,
    promiscuous: bool,
    fanout: Option<(Fanout, u16)>,
}

impl CaptureSocketBuilder {
    /// Validates `ring` against the system page size.
    ///
    /// # Errors
    /// Any `ConfigError` the ring geometry violates. No OS resource has been touched.
    pub fn new(kind: SocketKind, ring: RingConfig) -> Result<Self, ConfigError> {
        ring.validate(page_size())?;
        Ok(CaptureSocketBuilder {
            kind,
            ring,
            promiscuous: false,
            fanout: None,
        })
    }

    /// Puts the interface in promiscuous mode for as long as the socket is open.
    pub fn promiscuous(mut self, enable: bool) -> Self {
        self.promiscuous = enable;
        self
    }

    /// Joins every bound socket to fan-out group `group_id`.
    pub fn fanout(mut self, fanout: Fanout, group_id: u16) -> Self {
        self.fanout = Some((fanout, group_id));
        self
    }

    pub fn ring(&self) -> &RingConfig {
        &self.ring
    }

    /// Opens, configures and binds a socket on `interface`.
    ///
    /// # Errors
    /// `BindError::Config` for a malformed interface name, `BindError::MissingCapability`
    /// when the socket cannot be opened for lack of `CAP_NET_RAW`, and `BindError::Os`
    /// naming the failed step otherwise.
    pub fn bind(&self, interface: &str) -> Result<CaptureSocket, BindError> {
        validate_interface_name(interface)?;
        let if_index = resolve_interface(interface)?;
        let fd = open_socket(self.kind, interface)?;

        set_option(fd.as_fd(), PACKET_VERSION, &TPACKET_V3)
            .map_err(|e| BindError::os(BindStep::SetVersion, interface, e))?;
        set_option(fd.as_fd(), PACKET_RX_RING, &self.ring.to_request())
            .map_err(|e| BindError::os(BindStep::RegisterRing, interface, e))?;
        let mapping = RingMapping::map_socket(
            fd.as_fd(),
            self.ring.block_size as usize,
            self.ring.block_count as usize,
        )
        .map_err(|e| BindError::os(BindStep::MapRing, interface, e))?;

        bind_interface(fd.as_fd(), if_index)
            .map_err(|e| BindError::os(BindStep::Bind, interface, e))?;

        if self.promiscuous {
            let mreq = PacketMreq {
                mr_ifindex: if_index as i32,
                mr_type: PACKET_MR_PROMISC,
                ..Default::default()
            };
            set_option(fd.as_fd(), PACKET_ADD_MEMBERSHIP, &mreq)
                .map_err(|e| BindError::os(BindStep::Promiscuous, interface, e))?;
        }

        if let Some((fanout, group_id)) = self.fanout {
            set_option(fd.as_fd(), PACKET_FANOUT, &fanout.socket_arg(group_id))
                .map_err(|e| BindError::os(BindStep::JoinFanout, interface, e))?;
        }

        log::debug!(
            "Bound capture socket on {interface} (index {if_index}): {} blocks of {} bytes, fanout {:?}",
            self.ring.block_count,
            self.ring.block_size,
            self.fanout
        );
        Ok(CaptureSocket::new(fd, mapping, interface, if_index, self.ring))
    }
}

fn resolve_interface(interface: &str) -> Result<u32, BindError> {
    let name = CString::new(interface).map_err(|e| {
        BindError::os(
            BindStep::ResolveInterface,
            interface,
            io::Error::new(io::ErrorKind::InvalidInput, e),
        )
    })?;
    let index = unsafe { libc::if_nametoindex(name.as_ptr()) };
    if index == 0 {
        return Err(BindError::os(
            BindStep::ResolveInterface,
            interface,
            io::Error::last_os_error(),
        ));
    }
    Ok(index)
}

fn open_socket(kind: SocketKind, interface: &str) -> Result<OwnedFd, BindError> {
    let protocol = (libc::ETH_P_ALL as u16).to_be() as libc::c_int;
    let fd = unsafe { libc::socket(libc::AF_PACKET, kind.as_raw() | libc::SOCK_CLOEXEC, protocol) };
    if fd < 0 {
        let err = io::Error::last_os_error();
        if err.kind() == io::ErrorKind::PermissionDenied {
            // The check can itself fail (no procfs); keep the OS error then.
            if let Ok(false) = caps::has_cap(None, CapSet::Effective, Capability::CAP_NET_RAW) {
                return Err(BindError::MissingCapability {
                    interface: interface.to_string(),
                });
            }
        }
        return Err(BindError::os(BindStep::OpenSocket, interface, err));
    }
    Ok(unsafe { OwnedFd::from_raw_fd(fd) })
}

fn bind_interface(fd: BorrowedFd<'_>, if_index: u32) -> io::Result<()> {
    let mut addr: libc::sockaddr_ll = unsafe { std::mem::zeroed() };
    addr.sll_family = libc::AF_PACKET as libc::c_ushort;
    addr.sll_protocol = (libc::ETH_P_ALL as u16).to_be();
    addr.sll_ifindex = if_index as libc::c_int;
    unsafe {
        if libc::bind(
            fd.as_raw_fd(),
            &addr as *const _ as *const libc::sockaddr,
            size_of::<libc::sockaddr_ll>() as libc::socklen_t,
        ) < 0
        {
            return Err(io::Error::last_os_error());
        }
    }
    Ok(())
}

/// Sets the `SOL_PACKET` option `name` to `value`.
pub(crate) fn set_option<T>(fd: BorrowedFd<'_>, name: libc::c_int, value: &T) -> io::Result<()> {
    unsafe {
        if libc::setsockopt(
            fd.as_raw_fd(),
            libc::SOL_PACKET,
            name,
            value as *const T as *const libc::c_void,
            size_of::<T>() as libc::socklen_t,
        ) < 0
        {
            return Err(io::Error::last_os_error());
        }
    }
    Ok(())
}
