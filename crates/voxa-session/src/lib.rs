// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
mod cascade;
mod handler;
mod queue;
mod realtime;
mod transport;

pub use cascade::CascadePipeline;
pub use handler::{LlmHandles, SessionHandler, SessionSpec, TransportKind};
pub use queue::SpeechEventQueue;
pub use realtime::RealtimePipeline;
pub use transport::{
    browser, telephony, ChannelTransport, ChannelTransportHandle, TransportError, TransportFrame,
    TransportSink, TransportSource,
};
