#![cfg_attr(not(test), no_std)]

extern crate alloc;

pub mod generational_arena;
pub mod priority_queue;
