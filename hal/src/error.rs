// Copyright (c) 2023 Huawei Technologies Co.,Ltd. All rights reserved.
//
// StratoVirt is licensed under Mulan PSL v2.
// You can use this software according to the terms and conditions of the Mulan
// PSL v2.
// You may obtain a copy of Mulan PSL v2 at:
//         http://license.coscl.org.cn/MulanPSL2
// THIS SOFTWARE IS PROVIDED ON AN "AS IS" BASIS, WITHOUT WARRANTIES OF ANY
// KIND, EITHER EXPRESS OR IMPLIED, INCLUDING BUT NOT LIMITED TO
// NON-INFRINGEMENT, MERCHANTABILITY OR FIT FOR A PARTICULAR PURPOSE.
// See the Mulan PSL v2 for more details.

use thiserror::Error;

/// Structured statuses returned through the framework-facing API.
#[derive(Error, Debug)]
pub enum CameraError {
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),
    #[error("Camera is already in use")]
    AlreadyInUse,
    #[error("Camera is currently unavailable")]
    Unavailable,
    #[error("Operation is not supported")]
    NotSupported,
    #[error("Camera device is broken: {0}")]
    Broken(String),
}

pub type CameraResult<T> = std::result::Result<T, CameraError>;
