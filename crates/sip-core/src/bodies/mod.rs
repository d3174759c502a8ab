//! NOTIFY body formats

pub mod dialog_info;
pub mod message_summary;
