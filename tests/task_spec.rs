use assert_matches::assert_matches;

use kira_mirror::error::MirrorError;
use kira_mirror::task::{TaskKind, dispatch, parse_specs};

#[test]
fn commas_inside_parentheses_do_not_split() {
    let specs = parse_specs("decompress(remove=true),index_fasta(lcl=true;dbsize=a,b),alias").unwrap();
    assert_eq!(specs.len(), 3);
    assert_eq!(specs[0].name, "decompress");
    assert!(specs[0].params.flag("remove"));
    assert_eq!(specs[1].params.get("dbsize"), Some("a,b"));
    assert_eq!(specs[1].params.get("lcl"), Some("true"));
    assert!(specs[2].params.is_empty());
}

#[test]
fn colon_lists() {
    let specs = parse_specs("dicoindex(file=names.dmp:nodes.dmp)").unwrap();
    assert_eq!(specs[0].params.list("file"), vec!["names.dmp", "nodes.dmp"]);
}

#[test]
fn empty_text_has_no_tasks() {
    assert!(parse_specs("").unwrap().is_empty());
    assert!(parse_specs("  ").unwrap().is_empty());
}

#[test]
fn malformed_specs() {
    assert_matches!(parse_specs("decompress(remove=true"), Err(MirrorError::InvalidTaskSpec(_)));
    assert_matches!(parse_specs("decompress)"), Err(MirrorError::InvalidTaskSpec(_)));
    assert_matches!(parse_specs("decompress(remove)"), Err(MirrorError::InvalidTaskSpec(_)));
}

#[test]
fn names_dispatch_by_substring() {
    assert_eq!(dispatch("decompress"), Some(TaskKind::Decompress));
    assert_eq!(dispatch("Index_Fasta"), Some(TaskKind::IndexFasta));
    assert_eq!(dispatch("my_index_genbank_v2"), Some(TaskKind::IndexGenbank));
    assert_eq!(dispatch("dicoindex"), Some(TaskKind::DicoIndex));
    assert_eq!(dispatch("unknown"), None);
}
