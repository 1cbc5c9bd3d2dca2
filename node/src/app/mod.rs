//! Sample storage collaborator. It drives the node core end to end: writes go through the
//! write barrier under the epoch their flow is bound to.

pub mod records;
