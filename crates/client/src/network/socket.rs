//! Socket tuning for high-bandwidth, low-latency wireless links

use std::io;
use std::net::TcpStream;
use tracing::debug;

/// Send/receive buffer size (2 MiB)
const SOCKET_BUFFER_SIZE: i32 = 2 * 1024 * 1024;
/// SO_PRIORITY for real-time traffic
const SOCKET_PRIORITY: i32 = 6;
/// IP_TOS: minimize delay
const TOS_LOWDELAY: i32 = 0x10;

/// Apply latency and throughput tuning to a connected stream
///
/// `TCP_NODELAY` is required; the large buffers, priority and TOS bits
/// are Linux-only and quietly skipped elsewhere.
pub fn tune_stream(stream: &TcpStream) -> io::Result<()> {
    stream.set_nodelay(true)?;

    #[cfg(target_os = "linux")]
    {
        use std::os::unix::io::AsRawFd;
        let fd = stream.as_raw_fd();
        set_option(fd, libc::SOL_SOCKET, libc::SO_SNDBUF, SOCKET_BUFFER_SIZE)?;
        set_option(fd, libc::SOL_SOCKET, libc::SO_RCVBUF, SOCKET_BUFFER_SIZE)?;
        set_option(fd, libc::SOL_SOCKET, libc::SO_PRIORITY, SOCKET_PRIORITY)?;
        set_option(fd, libc::IPPROTO_IP, libc::IP_TOS, TOS_LOWDELAY)?;
        debug!("Socket tuned: 2MiB buffers, priority {}, TOS {:#04x}", SOCKET_PRIORITY, TOS_LOWDELAY);
    }

    Ok(())
}

#[cfg(target_os = "linux")]
fn set_option(fd: i32, level: i32, name: i32, value: i32) -> io::Result<()> {
    let result = unsafe {
        libc::setsockopt(
            fd,
            level,
            name,
            &value as *const i32 as *const libc::c_void,
            std::mem::size_of::<i32>() as libc::socklen_t,
        )
    };
    if result != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}
