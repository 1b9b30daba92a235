//! Test fixtures

mod two_peer;

pub use two_peer::{ROOM_URL, TestPeer, TwoPeerFixture, identity};
