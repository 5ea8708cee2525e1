//! Directory listings handed back to the protocol layer.

use ferry_vfs::DirEntry;

/// A finite, single-pass sequence of directory entries.
///
/// Consumed as it is read; listing again needs a fresh request.
#[derive(Debug)]
pub struct Lister {
    entries: std::vec::IntoIter<DirEntry>,
}

impl Lister {
    pub fn new(entries: Vec<DirEntry>) -> Self {
        Self {
            entries: entries.into_iter(),
        }
    }

    /// Single-entry listing, as returned for Stat.
    pub fn single(entry: DirEntry) -> Self {
        Self::new(vec![entry])
    }

    /// Fill `buf` with the next entries. Returns how many were written; 0
    /// means the listing is exhausted.
    pub fn fill(&mut self, buf: &mut [Option<DirEntry>]) -> usize {
        let mut n = 0;
        for slot in buf.iter_mut() {
            match self.entries.next() {
                Some(entry) => {
                    *slot = Some(entry);
                    n += 1;
                }
                None => break,
            }
        }
        n
    }
}

impl Iterator for Lister {
    type Item = DirEntry;

    fn next(&mut self) -> Option<DirEntry> {
        self.entries.next()
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.entries.size_hint()
    }
}

impl ExactSizeIterator for Lister {}
