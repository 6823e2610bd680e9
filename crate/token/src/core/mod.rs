// Copyright 2024 Cosmian Tech SAS
// Licensed under the Business Source License version 1.1.

pub mod attribute;
pub mod mechanism;
pub mod object;
