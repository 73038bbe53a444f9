//! Outer surfaces: the signed gateway callback, CSV replay input and
//! report output.

pub mod callback;
pub mod csv;
pub mod replay;
