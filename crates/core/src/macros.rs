// DLPatch - Preloader Download Handler Patcher
// Copyright (C) 2026 Andrii Shylenko
//
// This software is released under the MIT License.
// See the LICENSE file in the project root for full license information.

// Host builds forward to `tracing`. On the device the console is the only
// log, so the arguments are only type-checked.

macro_rules! trace_debug {
    ($($arg:tt)*) => {
        #[cfg(feature = "std")]
        tracing::debug!($($arg)*);
        #[cfg(not(feature = "std"))]
        {
            let _ = format_args!($($arg)*);
        }
    };
}

macro_rules! trace_info {
    ($($arg:tt)*) => {
        #[cfg(feature = "std")]
        tracing::info!($($arg)*);
        #[cfg(not(feature = "std"))]
        {
            let _ = format_args!($($arg)*);
        }
    };
}

macro_rules! trace_warn {
    ($($arg:tt)*) => {
        #[cfg(feature = "std")]
        tracing::warn!($($arg)*);
        #[cfg(not(feature = "std"))]
        {
            let _ = format_args!($($arg)*);
        }
    };
}

macro_rules! trace_error {
    ($($arg:tt)*) => {
        #[cfg(feature = "std")]
        tracing::error!($($arg)*);
        #[cfg(not(feature = "std"))]
        {
            let _ = format_args!($($arg)*);
        }
    };
}
