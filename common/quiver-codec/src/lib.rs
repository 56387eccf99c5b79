// Copyright the quiver authors. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

#![forbid(unsafe_code)]
#![cfg_attr(all(not(test), not(feature = "std")), no_std)]

pub mod decoder;
pub mod encoder;

pub use decoder::*;
pub use encoder::*;
