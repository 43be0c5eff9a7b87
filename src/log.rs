//! Logging interface, contingent on the `log` and `defmt-03` features
//!
//! This is the stack's single trace sink. With neither feature enabled,
//! every macro expands to nothing. Don't route your logger over a USB
//! pipe managed by this stack!

#![allow(unused_macros)]

macro_rules! trace {
    ($($args:tt)*) => {{
        #[cfg(feature = "log")]
        ::__log::trace!($($args)*);
        #[cfg(feature = "defmt-03")]
        ::defmt_03::trace!($($args)*);
    }};
}

macro_rules! debug {
    ($($args:tt)*) => {{
        #[cfg(feature = "log")]
        ::__log::debug!($($args)*);
        #[cfg(feature = "defmt-03")]
        ::defmt_03::debug!($($args)*);
    }};
}

macro_rules! info {
    ($($args:tt)*) => {{
        #[cfg(feature = "log")]
        ::__log::info!($($args)*);
        #[cfg(feature = "defmt-03")]
        ::defmt_03::info!($($args)*);
    }};
}

macro_rules! warn {
    ($($args:tt)*) => {{
        #[cfg(feature = "log")]
        ::__log::warn!($($args)*);
        #[cfg(feature = "defmt-03")]
        ::defmt_03::warn!($($args)*);
    }};
}

macro_rules! error {
    ($($args:tt)*) => {{
        #[cfg(feature = "log")]
        ::__log::error!($($args)*);
        #[cfg(feature = "defmt-03")]
        ::defmt_03::error!($($args)*);
    }};
}
