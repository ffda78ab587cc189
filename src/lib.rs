// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Resilient AMQP Client
//!
//! A publish-and-consume client for AMQP brokers that keeps the two roles
//! isolated and survives connection loss. One supervised session carries a
//! dedicated publish channel with confirmation tracking and watermark
//! backpressure, plus one consume channel per subscription with prefetch
//! flow control and exactly-one-acknowledgment semantics. A reconnection
//! supervisor owns the session, replaces it with geometric backoff on loss,
//! and re-establishes publisher and subscriptions under a fresh generation.

mod otel;

pub mod backoff;
pub mod channel;
pub mod client;
pub mod config;
pub mod confirm;
pub mod consumer;
pub mod errors;
pub mod publisher;
pub mod session;
pub mod supervisor;
