// Copyright (C) 2026 Brian Johnson
//
// This program is free software; you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation; either version 2 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License along
// with this program; if not, write to the Free Software Foundation, Inc.,
// 51 Franklin Street, Fifth Floor, Boston, MA 02110-1301 USA.

//! Splits a payload into fixed-size chunks

/// One contiguous slice of the payload, written with a single link write
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Chunk<'a> {
    pub index: usize,
    pub offset: usize,
    pub bytes: &'a [u8],
}

/// Stateless chunk partitioner. The caller owns the cursor.
#[derive(Debug, Clone, Copy)]
pub struct ChunkScheduler<'a> {
    payload: &'a [u8],
    chunk_size: usize,
}

impl<'a> ChunkScheduler<'a> {
    /// `chunk_size` must be non-zero; the session config rejects zero before
    /// a scheduler is ever built.
    pub fn new(payload: &'a [u8], chunk_size: usize) -> Self {
        debug_assert!(chunk_size > 0, "chunk size must be non-zero");
        ChunkScheduler { payload, chunk_size }
    }

    /// The slice `[offset, min(offset + chunk_size, len))`. Empty once the
    /// offset has reached the end of the payload.
    pub fn next(&self, offset: usize) -> Chunk<'a> {
        let start = offset.min(self.payload.len());
        let end = offset.saturating_add(self.chunk_size).min(self.payload.len());
        Chunk {
            index: offset / self.chunk_size,
            offset,
            bytes: &self.payload[start..end],
        }
    }

    pub fn advance(&self, offset: usize) -> usize {
        offset.saturating_add(self.chunk_size)
    }

    pub fn is_complete(&self, offset: usize) -> bool {
        offset >= self.payload.len()
    }

    /// Number of data round trips needed for the whole payload
    pub fn chunk_count(&self) -> usize {
        self.payload.len().div_ceil(self.chunk_size)
    }
}
