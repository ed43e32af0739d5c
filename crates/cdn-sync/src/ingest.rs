//! Writing new content into the buffer and reading items back.

use tracing::{error, info, warn};

use cdn_crypto::ContentHasher;
use cdn_meta::MetadataStore;
use cdn_store::{read_to_end, StorageUnit};
use cdn_types::{Clock, Item, ItemId, ItemType, ItemUnit, ItemUnitId, UnitRole};

use crate::error::{SyncError, SyncResult};

/// Store `content` in the buffer as a new finalized item.
///
/// The item is registered as incoming, written through the buffer's writer,
/// finalized, and bound to the buffer, in that order. A failed write removes
/// the incoming record again.
pub async fn ingest(
    buffer: &dyn StorageUnit,
    metadata: &dyn MetadataStore,
    clock: &dyn Clock,
    item_type: ItemType,
    content: &[u8],
) -> SyncResult<Item> {
    if buffer.role() != UnitRole::Buffer {
        return Err(SyncError::Configuration(format!(
            "ingest target {} is not the buffer unit",
            buffer.id()
        )));
    }
    let locator = ContentHasher::ITEM.locator(content);
    let mut item = Item::new(item_type, clock.now());
    metadata.put_item(&item).await?;

    let binding = ItemUnit {
        id: ItemUnitId::new(),
        item_id: item.id(),
        unit_id: buffer.id().clone(),
        locator: locator.clone(),
        created: clock.now(),
    };
    let stored = match write_buffer(buffer, &binding, content).await {
        Ok(stored) => stored,
        Err(e) => {
            if let Err(cleanup) = metadata.remove_incoming_item(item.id()).await {
                warn!(item = %item.id(), error = %cleanup, "unable to remove incoming item");
            }
            return Err(e);
        }
    };

    item.finalize(locator, content.len() as u64, clock.now())?;
    metadata.put_item(&item).await?;
    metadata.insert_binding(&binding).await?;
    info!(
        item = %item.id(),
        item_type = %item_type,
        locator = %binding.locator,
        bytes = content.len(),
        stored,
        "item ingested"
    );
    Ok(item)
}

async fn write_buffer(
    buffer: &dyn StorageUnit,
    binding: &ItemUnit,
    content: &[u8],
) -> SyncResult<u64> {
    let mut writer = buffer
        .new_writer(binding)
        .await
        .map_err(SyncError::unit(buffer.id(), "open writer"))?;
    if let Err(e) = writer.write_chunk(content).await {
        if let Err(abort_err) = writer.abort().await {
            error!(unit = %buffer.id(), error = %abort_err, "writer abort failed");
        }
        return Err(SyncError::unit(buffer.id(), "write")(e));
    }
    writer
        .close()
        .await
        .map_err(SyncError::unit(buffer.id(), "close writer"))
}

/// Read a bound item back from `unit` as plaintext.
pub async fn read_item(
    unit: &dyn StorageUnit,
    metadata: &dyn MetadataStore,
    item_id: ItemId,
) -> SyncResult<Vec<u8>> {
    let binding = metadata
        .lookup_binding(item_id, unit.id())
        .await?
        .ok_or_else(|| {
            SyncError::unit(unit.id(), "lookup")(cdn_store::StoreError::NotFound(format!(
                "item {item_id} is not bound to {}",
                unit.id()
            )))
        })?;
    let reader = unit
        .new_reader(&binding)
        .await
        .map_err(SyncError::unit(unit.id(), "open reader"))?;
    read_to_end(reader)
        .await
        .map_err(SyncError::unit(unit.id(), "read"))
}
