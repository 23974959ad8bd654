use std::io;

/// Duplex stream of raw IP packets. One call moves exactly one packet.
pub trait Tunnel {
    async fn recv(&mut self, buf: &mut [u8]) -> io::Result<usize>;
    async fn send(&mut self, packet: &[u8]) -> io::Result<()>;
}

#[cfg(unix)]
pub use fd::FdTunnel;

#[cfg(unix)]
mod fd {
    use std::io;
    use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};

    use libc::c_void;
    use tokio::io::unix::AsyncFd;

    use super::Tunnel;

    /// Tunnel backed by a file descriptor handed over by whatever process
    /// created and configured the interface.
    pub struct FdTunnel {
        fd: AsyncFd<OwnedFd>,
    }

    impl FdTunnel {
        /// Wrap a duplicate of `fd`. The original stays open, so a new session
        /// can be established from the same descriptor after this one is dropped.
        pub fn from_inherited(fd: RawFd) -> io::Result<Self> {
            let dup = unsafe { libc::dup(fd) };
            if dup < 0 {
                return Err(io::Error::last_os_error());
            }
            let owned = unsafe { OwnedFd::from_raw_fd(dup) };
            set_nonblocking(owned.as_raw_fd())?;
            Ok(Self {
                fd: AsyncFd::try_new(owned)?,
            })
        }
    }

    fn set_nonblocking(fd: RawFd) -> io::Result<()> {
        let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
        if flags < 0 {
            return Err(io::Error::last_os_error());
        }
        if unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) } < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    impl Tunnel for FdTunnel {
        async fn recv(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            loop {
                let mut guard = self.fd.readable().await?;
                let res = guard.try_io(|inner| {
                    let n = unsafe {
                        libc::read(
                            inner.get_ref().as_raw_fd(),
                            buf.as_mut_ptr() as *mut c_void,
                            buf.len(),
                        )
                    };
                    if n < 0 {
                        Err(io::Error::last_os_error())
                    } else {
                        Ok(n as usize)
                    }
                });
                match res {
                    Ok(result) => return result,
                    Err(_would_block) => continue,
                }
            }
        }

        async fn send(&mut self, packet: &[u8]) -> io::Result<()> {
            loop {
                let mut guard = self.fd.writable().await?;
                let res = guard.try_io(|inner| {
                    let n = unsafe {
                        libc::write(
                            inner.get_ref().as_raw_fd(),
                            packet.as_ptr() as *const c_void,
                            packet.len(),
                        )
                    };
                    if n < 0 {
                        Err(io::Error::last_os_error())
                    } else {
                        Ok(n as usize)
                    }
                });
                match res {
                    Ok(Ok(n)) if n == packet.len() => return Ok(()),
                    Ok(Ok(n)) => {
                        return Err(io::Error::new(
                            io::ErrorKind::WriteZero,
                            format!("short tunnel write: {} of {} bytes", n, packet.len()),
                        ));
                    }
                    Ok(Err(err)) => return Err(err),
                    Err(_would_block) => continue,
                }
            }
        }
    }

}
