//! Integration tests for the chat client core, driven end to end against a
//! scripted in-memory gateway.


mod message_store;
mod notifications;
mod storage;
