use byteorder::{ByteOrder, LittleEndian};

use crate::common::types::{Page, PageId, PAGE_SIZE};
use crate::index::btree::error::BTreeError;

// Header page (page id 0) layout:
// - record_count: u32 at offset 0
// - records of 36 bytes each from offset 4: a zero-padded 32-byte index name
//   followed by the index's root page id (i32)
const RECORD_COUNT_OFFSET: usize = 0;
const RECORDS_OFFSET: usize = 4;
const NAME_SIZE: usize = 32;
const RECORD_SIZE: usize = NAME_SIZE + 4;
const MAX_RECORDS: usize = (PAGE_SIZE - RECORDS_OFFSET) / RECORD_SIZE;

fn record_count(page: &Page) -> usize {
    LittleEndian::read_u32(&page.data[RECORD_COUNT_OFFSET..]) as usize
}

fn record_name(page: &Page, index: usize) -> &[u8] {
    let at = RECORDS_OFFSET + index * RECORD_SIZE;
    &page.data[at..at + NAME_SIZE]
}

fn padded_name(name: &str) -> Result<[u8; NAME_SIZE], BTreeError> {
    if name.len() > NAME_SIZE {
        return Err(BTreeError::IndexNameTooLong(name.to_string()));
    }
    let mut out = [0u8; NAME_SIZE];
    out[..name.len()].copy_from_slice(name.as_bytes());
    Ok(out)
}

fn find_record(page: &Page, name: &[u8; NAME_SIZE]) -> Option<usize> {
    (0..record_count(page)).find(|&i| record_name(page, i) == name)
}

/// Look up the root page id registered under the index name, if any
pub fn lookup_root(page: &Page, name: &str) -> Result<Option<PageId>, BTreeError> {
    let name = padded_name(name)?;
    Ok(find_record(page, &name).map(|i| {
        let at = RECORDS_OFFSET + i * RECORD_SIZE + NAME_SIZE;
        LittleEndian::read_i32(&page.data[at..])
    }))
}

/// Register or update the root page id for the index name
pub fn set_root(page: &mut Page, name: &str, root_page_id: PageId) -> Result<(), BTreeError> {
    let name = padded_name(name)?;
    let index = match find_record(page, &name) {
        Some(i) => i,
        None => {
            let count = record_count(page);
            if count >= MAX_RECORDS {
                return Err(BTreeError::HeaderFull);
            }
            let at = RECORDS_OFFSET + count * RECORD_SIZE;
            page.data[at..at + NAME_SIZE].copy_from_slice(&name);
            LittleEndian::write_u32(&mut page.data[RECORD_COUNT_OFFSET..], (count + 1) as u32);
            count
        }
    };
    let at = RECORDS_OFFSET + index * RECORD_SIZE + NAME_SIZE;
    LittleEndian::write_i32(&mut page.data[at..], root_page_id);
    Ok(())
}
