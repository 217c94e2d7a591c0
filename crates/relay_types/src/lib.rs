// Copyright 2021-2024 SecureDNA Stiftung (SecureDNA Foundation) <licensing@securedna.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Value types shared by the relay server and its caches

pub mod frame;
pub mod message;
pub mod request_id;

pub use frame::{Frame, FrameError};
pub use message::{Message, PeerMessage};
pub use request_id::RequestId;
