//! The crawl / extract / diff / insight pipeline.

pub mod canonical;
pub mod diff;
pub mod discovery;
pub mod extract;
pub mod fetch;
pub mod html;
pub mod insight;
pub mod runner;
pub mod url;
