// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Parsing of H.266 (VVC) parameter sets, picture headers and slice headers,
//! with the reference picture list construction and reference picture marking
//! that go with them.

pub mod bitstream_utils;
pub mod codec;
pub mod utils;
