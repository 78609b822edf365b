//! The three on-disk container formats (C6-C8): oiDL, oiCA, oiSH.

pub mod oica;
pub mod oidl;
pub mod oish;
