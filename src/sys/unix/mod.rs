mod selector;
mod waker;

pub(crate) use selector::{event, Event, Events, Selector};
pub(crate) use waker::Waker;
