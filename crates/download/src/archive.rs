// Copyright 2025 Crrow
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//      http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! On-the-fly ZIP archives of stored objects.
//!
//! A producer task writes the archive into one end of a bounded in-memory
//! pipe while the response body drains the other end. The producer stalls
//! whenever the pipe is full, so it never runs further ahead of a slow client
//! than the pipe capacity. Entries use data descriptors, so no entry has to be
//! buffered to learn its size.
//!
//! Failure handling is asymmetric. The first body chunk is awaited before the
//! body is handed out, so a failure before any byte was produced is returned
//! as an error. A failure after that ends the body with an error item, which
//! aborts the connection: the status line has already been sent. An archive is
//! never finalized after a failure, so a client never receives a well-formed
//! archive that silently lacks entries.

use std::{
    collections::HashSet,
    sync::Arc,
    time::Instant,
};

use async_zip::{ZipEntryBuilder, tokio::write::ZipFileWriter};
use bytes::Bytes;
use futures::{AsyncWriteExt, StreamExt, future, stream, stream::BoxStream};
use snafu::{IntoError, ResultExt};
use tokio::io::DuplexStream;
use tokio_util::{io::ReaderStream, task::AbortOnDropHandle};
use tracing::{Instrument, debug, error, info_span};

use crate::{
    config::{ArchiveCompression, ArchiveConfig},
    error::{
        ArchiveError, FinalizeSnafu, OpenSourceSnafu, PipeSnafu, ProducerSnafu, ReadSourceSnafu,
        WriteDataSnafu, WriteEntrySnafu,
    },
    filename::{numbered, sanitize_filename},
    metrics,
    storage::{ObjectDescriptor, Storage},
    tenant::TenantId,
};

/// Archive bytes as they are produced.
pub type ArchiveBody = BoxStream<'static, Result<Bytes, ArchiveError>>;

/// One planned entry of an archive.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ArchiveEntry {
    pub storage_key: String,
    /// Sanitized and unique within the archive.
    pub name:        String,
    pub size:        u64,
}

/// Sanitizes names, orders entries by name and disambiguates collisions.
///
/// The sort is stable, so objects with equal names keep their request order
/// and get numbered in that order. Collisions are detected case-insensitively
/// so that archives extract cleanly on case-insensitive filesystems.
#[must_use]
pub fn plan_entries(objects: Vec<ObjectDescriptor>) -> Vec<ArchiveEntry> {
    let mut entries: Vec<ArchiveEntry> = objects
        .into_iter()
        .map(|object| ArchiveEntry {
            name:        sanitize_filename(&object.display_name),
            storage_key: object.storage_key,
            size:        object.size,
        })
        .collect();
    entries.sort_by(|a, b| a.name.cmp(&b.name));

    let mut taken = HashSet::with_capacity(entries.len());
    for entry in &mut entries {
        if !taken.insert(entry.name.to_lowercase()) {
            let unique = (2..)
                .map(|n| numbered(&entry.name, n))
                .find(|candidate| !taken.contains(&candidate.to_lowercase()))
                .unwrap_or_else(|| entry.name.clone());
            taken.insert(unique.to_lowercase());
            entry.name = unique;
        }
    }
    entries
}

#[derive(Debug, Clone)]
pub struct ArchiveStreamer {
    storage: Arc<dyn Storage>,
    config:  ArchiveConfig,
}

impl ArchiveStreamer {
    pub fn new(storage: Arc<dyn Storage>, config: ArchiveConfig) -> Self { Self { storage, config } }

    /// Starts producing the archive for `tenant` and waits for its first
    /// bytes.
    ///
    /// Dropping the returned body cancels production and releases every
    /// storage stream still open.
    pub async fn stream(
        &self,
        tenant: &TenantId,
        objects: Vec<ObjectDescriptor>,
    ) -> Result<ArchiveBody, ArchiveError> {
        let entries = plan_entries(objects);
        let capacity = self.config.buffer_size.as_usize().max(1);
        let (writer, reader) = tokio::io::duplex(capacity);
        let span = info_span!("archive", %tenant, entries = entries.len());
        let producer = AbortOnDropHandle::new(tokio::spawn(
            write_archive(
                Arc::clone(&self.storage),
                tenant.clone(),
                entries,
                self.config.compression,
                writer,
            )
            .instrument(span),
        ));
        metrics::ARCHIVES.with_label_values(&["started"]).inc();

        let mut chunks = ReaderStream::with_capacity(reader, capacity);
        let first = match chunks.next().await {
            Some(Ok(chunk)) => chunk,
            Some(Err(error)) => {
                drop(producer);
                metrics::ARCHIVES.with_label_values(&["aborted"]).inc();
                return Err(PipeSnafu.into_error(error));
            }
            None => {
                // The producer closed the pipe without writing anything.
                join_producer(producer).await?;
                return Ok(stream::empty().boxed());
            }
        };

        let head = stream::once(future::ready(Ok(first)));
        let tail = chunks.map(|chunk| chunk.context(PipeSnafu));
        let outcome = stream::once(join_producer(producer))
            .filter_map(|result| future::ready(result.err().map(Err)));
        Ok(head
            .chain(tail)
            .chain(outcome)
            .inspect(|chunk| {
                if let Ok(chunk) = chunk {
                    metrics::ARCHIVE_BYTES.inc_by(chunk.len() as u64);
                }
            })
            .boxed())
    }
}

async fn join_producer(
    producer: AbortOnDropHandle<Result<(), ArchiveError>>,
) -> Result<(), ArchiveError> {
    let result = match producer.await {
        Ok(result) => result,
        Err(join) => Err(ProducerSnafu.into_error(join)),
    };
    let outcome = if result.is_ok() { "completed" } else { "aborted" };
    metrics::ARCHIVES.with_label_values(&[outcome]).inc();
    result
}

struct ActiveArchive;

impl ActiveArchive {
    fn enter() -> Self {
        metrics::ACTIVE_ARCHIVES.inc();
        Self
    }
}

impl Drop for ActiveArchive {
    fn drop(&mut self) { metrics::ACTIVE_ARCHIVES.dec(); }
}

async fn write_archive(
    storage: Arc<dyn Storage>,
    tenant: TenantId,
    entries: Vec<ArchiveEntry>,
    compression: ArchiveCompression,
    writer: DuplexStream,
) -> Result<(), ArchiveError> {
    let _active = ActiveArchive::enter();
    let started = Instant::now();
    let mut zip = ZipFileWriter::with_tokio(writer);
    let mut total = 0u64;

    for entry in &entries {
        let result = write_entry(storage.as_ref(), &mut zip, entry, compression).await;
        match result {
            Ok(written) => total += written,
            Err(error) => {
                error!(
                    %tenant,
                    storage_key = %entry.storage_key,
                    entry = %entry.name,
                    bytes = total,
                    error = %error,
                    "Archive aborted"
                );
                return Err(error);
            }
        }
    }

    zip.close().await.context(FinalizeSnafu)?;
    debug!(
        entries = entries.len(),
        bytes = total,
        elapsed = ?started.elapsed(),
        "Archive finalized"
    );
    Ok(())
}

/// Opens the source before writing the entry header, so an unreadable
/// object never leaves a dangling header behind.
async fn write_entry(
    storage: &dyn Storage,
    zip: &mut ZipFileWriter<DuplexStream>,
    entry: &ArchiveEntry,
    compression: ArchiveCompression,
) -> Result<u64, ArchiveError> {
    let mut source = storage
        .open_read_stream(&entry.storage_key)
        .await
        .context(OpenSourceSnafu {
            key: &entry.storage_key,
        })?;

    let builder = ZipEntryBuilder::new(entry.name.clone().into(), compression.into());
    let mut entry_writer = zip
        .write_entry_stream(builder)
        .await
        .context(WriteEntrySnafu { name: &entry.name })?;

    let mut written = 0u64;
    while let Some(chunk) = source.next().await {
        let chunk = chunk.context(ReadSourceSnafu {
            key: &entry.storage_key,
        })?;
        entry_writer
            .write_all(&chunk)
            .await
            .context(WriteDataSnafu { name: &entry.name })?;
        written += chunk.len() as u64;
    }
    entry_writer
        .close()
        .await
        .context(WriteEntrySnafu { name: &entry.name })?;
    Ok(written)
}
