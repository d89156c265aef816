use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

/// Observer invoked with the raw text of a frame.
pub type FrameHandler = Arc<dyn Fn(&str) + Send + Sync>;

/// Identifies a registered handler. Ids increase monotonically and are never reused within one
/// connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct HandlerId(u64);

impl fmt::Display for HandlerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Receive,
    Send,
}

/// Receive and send handler tables sharing one id sequence.
#[derive(Default)]
pub(crate) struct HandlerTables {
    next_id: u64,
    receive: BTreeMap<HandlerId, FrameHandler>,
    send: BTreeMap<HandlerId, FrameHandler>,
}

impl HandlerTables {
    pub(crate) fn register(&mut self, direction: Direction, handler: FrameHandler) -> HandlerId {
        let id = HandlerId(self.next_id);
        self.next_id += 1;
        self.table_mut(direction).insert(id, handler);
        id
    }

    /// Removes the handler from whichever table holds it.
    pub(crate) fn remove(&mut self, id: HandlerId) -> Option<Direction> {
        if self.receive.remove(&id).is_some() {
            Some(Direction::Receive)
        } else if self.send.remove(&id).is_some() {
            Some(Direction::Send)
        } else {
            None
        }
    }

    /// Handlers of one direction in registration order, detached from the table so they can be
    /// invoked without holding the connection lock.
    pub(crate) fn snapshot(&self, direction: Direction) -> Vec<FrameHandler> {
        self.table(direction).values().cloned().collect()
    }

    pub(crate) fn len(&self, direction: Direction) -> usize {
        self.table(direction).len()
    }

    fn table(&self, direction: Direction) -> &BTreeMap<HandlerId, FrameHandler> {
        match direction {
            Direction::Receive => &self.receive,
            Direction::Send => &self.send,
        }
    }

    fn table_mut(&mut self, direction: Direction) -> &mut BTreeMap<HandlerId, FrameHandler> {
        match direction {
            Direction::Receive => &mut self.receive,
            Direction::Send => &mut self.send,
        }
    }
}
