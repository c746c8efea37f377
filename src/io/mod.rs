use std::error::Error;
use std::fmt;
use std::fs::File;
use std::io::Write;
use std::path::Path;

use anyhow::bail;
use log::info;

use crate::tree::Tree;
use crate::Result;

pub(crate) struct DataError {
    pub(crate) message: String,
}
impl fmt::Debug for DataError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}
impl fmt::Display for DataError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}
impl Error for DataError {}

fn create_new(path: &Path) -> Result<File> {
    if path.exists() {
        bail!(DataError {
            message: format!("File {} already exists", path.display())
        });
    }
    Ok(File::create(path)?)
}

/// Writes newick trees to the given file path, one per line, with branch lengths printed with
/// `precision` decimals. Will return an error if the file already exists.
///
/// # Arguments
/// * `trees` - Trees to write.
/// * `precision` - Number of decimals of the branch lengths.
/// * `path` - Path to the newick file.
///
/// # Example
/// ```
/// # use std::fs::read_to_string;
/// use cnetree::io::write_newick_to_file;
/// use cnetree::tree;
///
/// let dir = tempfile::tempdir().unwrap();
/// let path = dir.path().join("trees.nwk");
/// let tree = tree!(3; (3, 0, 1), (3, 1, 1), (4, 3, 1), (4, 2, 2));
/// write_newick_to_file(&[tree], 1, &path).unwrap();
/// # assert_eq!(read_to_string(&path).unwrap(), "((1:1.0,2:1.0)4:1.0,3:2.0)5;\n");
/// assert!(write_newick_to_file(&[], 1, &path).is_err());
/// ```
pub fn write_newick_to_file(trees: &[Tree], precision: usize, path: &Path) -> Result<()> {
    info!("Writing newick trees to file {}", path.display());
    let mut writer = create_new(path)?;
    for tree in trees {
        writer.write_all(tree.to_newick(precision).as_bytes())?;
        writer.write_all(b"\n")?;
    }
    info!("Finished writing successfully");
    Ok(())
}

/// Writes the edge table of a tree, optionally with the number of mutations per edge.
/// Will return an error if the file already exists.
pub fn write_edge_table_to_file(tree: &Tree, with_nmuts: bool, path: &Path) -> Result<()> {
    info!("Writing edge table to file {}", path.display());
    let mut writer = create_new(path)?;
    writer.write_all(tree.edge_table(with_nmuts).as_bytes())?;
    info!("Finished writing successfully");
    Ok(())
}
