use std::io;
use std::result;
use std::time::Duration;

pub use libc::{epoll_event, EPOLLERR, EPOLLIN, EPOLLPRI};

pub type Result<T> = result::Result<T, io::Error>;

// EventFd is used to wake up a thread that's waiting for epoll_wait() to
// return. The counter is never read back down, so after the first notify()
// the descriptor stays readable for every level-triggered waiter.
#[derive(Debug)]
pub struct EventFd {
    fd: i32,
}

impl EventFd {
    pub fn new() -> Result<EventFd> {
        Ok(EventFd {
            fd: parse_retval!(unsafe {
                libc::eventfd(0, libc::EFD_NONBLOCK | libc::EFD_SEMAPHORE)
            })?,
        })
    }

    pub fn notify(&self) -> Result<()> {
        let buffer: u64 = 1;

        parse_retval!(unsafe {
            libc::write(self.fd, &buffer as *const u64 as *const libc::c_void, 8)
        })?;

        Ok(())
    }

    pub fn fd(&self) -> i32 {
        self.fd
    }
}

impl Drop for EventFd {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.fd);
        }
    }
}

#[derive(Debug)]
pub struct Epoll {
    fd: libc::c_int,
}

impl Epoll {
    pub fn new() -> Result<Epoll> {
        Ok(Epoll {
            fd: parse_retval!(unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) })?,
        })
    }

    pub fn add(&self, fd: i32, id: u64, event_mask: i32) -> Result<()> {
        let mut event = libc::epoll_event {
            events: event_mask as u32,
            u64: id,
        };

        parse_retval!(unsafe { libc::epoll_ctl(self.fd, libc::EPOLL_CTL_ADD, fd, &mut event) })?;

        Ok(())
    }

    pub fn wait(
        &self,
        events: &mut [libc::epoll_event],
        timeout: Option<Duration>,
    ) -> Result<usize> {
        if events.is_empty() {
            return Ok(0);
        }

        Ok(parse_retval!(unsafe {
            libc::epoll_wait(
                self.fd,
                events.as_mut_ptr(),
                events.len() as i32,
                timeout_ms(timeout),
            )
        })? as usize)
    }
}

impl Drop for Epoll {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.fd);
        }
    }
}

// epoll_wait timeout in milliseconds. Durations past i32::MAX ms clamp
// instead of wrapping into a negative (infinite) timeout.
fn timeout_ms(timeout: Option<Duration>) -> i32 {
    match timeout {
        Some(duration) => duration.as_millis().min(i32::MAX as u128) as i32,
        None => -1,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timeout_conversion_clamps_instead_of_wrapping() {
        assert_eq!(timeout_ms(None), -1);
        assert_eq!(timeout_ms(Some(Duration::from_millis(0))), 0);
        assert_eq!(timeout_ms(Some(Duration::from_millis(1_500))), 1_500);

        // 30 days is past i32::MAX milliseconds.
        let month = Duration::from_secs(60 * 60 * 24 * 30);
        assert_eq!(timeout_ms(Some(month)), i32::MAX);
    }
}
