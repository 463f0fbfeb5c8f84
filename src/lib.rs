/* Generic tree structures for storage of spatial data.
Copyright (C) 2023  Alexander Pyattaev

This program is free software: you can redistribute it and/or modify
it under the terms of the GNU General Public License as published by
the Free Software Foundation, either version 3 of the License, or
(at your option) any later version.

This program is distributed in the hope that it will be useful,
but WITHOUT ANY WARRANTY; without even the implied warranty of
MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
GNU General Public License for more details.

You should have received a copy of the GNU General Public License
along with this program.  If not, see <https://www.gnu.org/licenses/>.
*/
#![doc = include_str!("../README.md")]

pub mod point;
pub use crate::point::*;

pub mod coords;
pub use crate::coords::*;

pub mod error;
pub use crate::error::*;

pub mod settings;
pub use crate::settings::*;

pub mod record;
pub use crate::record::*;

pub mod sampling;
pub use crate::sampling::*;

pub mod storage;
pub use crate::storage::{OutputLayout, INDEX_FILE_EXTENSION, NODE_FILE_EXTENSION};

pub mod processor;
pub use crate::processor::*;

pub mod worker;
pub use crate::worker::*;

pub mod index;
pub use crate::index::*;

pub mod dispatcher;
pub use crate::dispatcher::*;

pub mod builder;
pub use crate::builder::*;

#[cfg(feature = "rand")]
pub mod synthetic;
#[cfg(feature = "rand")]
pub use crate::synthetic::*;
