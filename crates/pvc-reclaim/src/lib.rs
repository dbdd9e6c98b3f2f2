/*
 * 5D Labs PVC Reclaim - Kubernetes Controller for PersistentVolumeClaim Recovery
 * Copyright (C) 2025 5D Labs
 *
 * This program is free software: you can redistribute it and/or modify
 * it under the terms of the GNU Affero General Public License as published
 * by the Free Software Foundation, either version 3 of the License, or
 * (at your option) any later version.
 *
 * This program is distributed in the hope that it will be useful,
 * but WITHOUT ANY WARRANTY; without even the implied warranty of
 * MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
 * GNU Affero General Public License for more details.
 *
 * You should have received a copy of the GNU Affero General Public License
 * along with this program. If not, see <https://www.gnu.org/licenses/>.
 */

#![allow(clippy::missing_errors_doc, clippy::missing_panics_doc, clippy::doc_markdown)]

//! PVC reclaim controller library
//!
//! Mirrors every Bound `PersistentVolumeClaim` into a `PVCReclaim` record so the
//! claim can be recreated and re-bound to its `PersistentVolume` after an
//! accidental deletion.

pub mod crds;
pub mod tasks;

// Re-export commonly used types
pub use crds::{PVCReclaim, PVCReclaimSpec, PVCReclaimStatus, RecoverStatus};
pub use tasks::config::ControllerConfig;
pub use tasks::store::{InMemoryStore, KubeStore, ResourceStore};
pub use tasks::types::{Context, Error, NamespacedName, Result};
