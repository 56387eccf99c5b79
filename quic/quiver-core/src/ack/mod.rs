// Copyright the quiver authors. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

pub mod ranges;

pub use ranges::AckRanges;
