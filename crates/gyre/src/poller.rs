use std::{collections::HashMap, io, os::fd::RawFd, sync::Arc};

use gyre_utils::safe_panic;
use mio::{Events, Poll, Token, unix::SourceFd};

use crate::{
    channel::Channel,
    error::{FatalKind, die},
};

const MAX_READY_EVENTS: usize = 1024;

struct Slot {
    channel: Arc<Channel>,
    /// Whether the fd currently sits in the kernel interest set. A channel
    /// with empty interest keeps its slot but leaves the kernel set.
    registered: bool,
}

/// Readiness demultiplexer keyed by raw descriptor.
///
/// Registration goes through [`SourceFd`] so sockets, eventfds and timerfds
/// all take the same path; the token is the fd itself. Errors from the
/// kernel interest-set calls are unrecoverable and exit the process, with
/// the exception of `wait` interruption which yields an empty ready set.
pub struct Poller {
    poll: Poll,
    events: Events,
    slots: HashMap<RawFd, Slot>,
}

impl Poller {
    pub fn new() -> io::Result<Self> {
        Ok(Self {
            poll: Poll::new()?,
            events: Events::with_capacity(MAX_READY_EVENTS),
            slots: HashMap::new(),
        })
    }

    /// Syncs the kernel interest set to the channel's current interest mask,
    /// adding the fd on first use.
    pub fn update(&mut self, channel: &Arc<Channel>) {
        let fd = channel.fd();
        let interest = to_mio_interest(channel.interest_set());

        let slot = self
            .slots
            .entry(fd)
            .or_insert_with(|| Slot { channel: Arc::clone(channel), registered: false });

        let outcome = match (slot.registered, interest) {
            (false, Some(interest)) => {
                slot.registered = true;
                self.poll.registry().register(&mut SourceFd(&fd), Token(fd as usize), interest)
            }
            (true, Some(interest)) => {
                self.poll.registry().reregister(&mut SourceFd(&fd), Token(fd as usize), interest)
            }
            (true, None) => {
                slot.registered = false;
                self.poll.registry().deregister(&mut SourceFd(&fd))
            }
            (false, None) => Ok(()),
        };

        if let Err(err) = outcome {
            die(FatalKind::PollCtl, &err);
        }
    }

    /// Deletes the fd from the kernel set and forgets the channel.
    pub fn remove(&mut self, channel: &Channel) {
        let Some(slot) = self.slots.remove(&channel.fd()) else {
            return;
        };
        if slot.registered {
            if let Err(err) = self.poll.registry().deregister(&mut SourceFd(&channel.fd())) {
                die(FatalKind::PollCtl, &err);
            }
        }
    }

    /// Blocks until readiness, then pushes each ready channel with its ready
    /// mask set. Interruption yields an empty set.
    pub fn wait(&mut self, ready: &mut Vec<Arc<Channel>>) {
        if let Err(err) = self.poll.poll(&mut self.events, None) {
            if err.kind() == io::ErrorKind::Interrupted {
                return;
            }
            die(FatalKind::PollWait, &err);
        }

        for event in &self.events {
            let fd = event.token().0 as RawFd;
            let Some(slot) = self.slots.get(&fd) else {
                safe_panic!("got readiness for unknown fd {fd}");
                continue;
            };
            slot.channel.set_ready(crate::channel::EventSet::from_mio(event));
            ready.push(Arc::clone(&slot.channel));
        }
    }
}

fn to_mio_interest(set: crate::channel::EventSet) -> Option<mio::Interest> {
    use crate::channel::EventSet;

    let read = set.contains(EventSet::READABLE);
    let write = set.contains(EventSet::WRITABLE);
    match (read, write) {
        (true, true) => Some(mio::Interest::READABLE | mio::Interest::WRITABLE),
        (true, false) => Some(mio::Interest::READABLE),
        (false, true) => Some(mio::Interest::WRITABLE),
        (false, false) => None,
    }
}
