use booktester::errors::BookTesterError;
use booktester::parser::parse_listings;
use booktester::types::{LineRange, ListingKind};

const CHAPTER_02: &str = include_str!("fixtures/chapters/chapter_02.asciidoc");

#[test]
fn chapter_fixture_yields_listings_in_document_order() {
    let listings = parse_listings(CHAPTER_02).expect("parsed");
    let summary = listings
        .iter()
        .map(|listing| (listing.kind, listing.address))
        .collect::<Vec<_>>();
    assert_eq!(
        summary,
        vec![
            (ListingKind::CodeListing, LineRange::new(8, 15)),
            (ListingKind::Command, LineRange::new(21, 21)),
            (ListingKind::Output, LineRange::new(25, 30)),
            (ListingKind::CodeListing, LineRange::new(36, 41)),
            (ListingKind::CurrentContents, LineRange::new(47, 49)),
            (ListingKind::Command, LineRange::new(53, 53)),
            (ListingKind::Command, LineRange::new(58, 60)),
        ]
    );
}

#[test]
fn chapter_fixture_carries_files_labels_and_flags() {
    let listings = parse_listings(CHAPTER_02).expect("parsed");

    assert_eq!(listings[0].target_file.as_deref(), Some("lists/tests.py"));
    assert_eq!(listings[0].commit_label.as_deref(), Some("ch02l001"));
    assert_eq!(listings[3].commit_label.as_deref(), Some("ch02l002"));
    assert_eq!(listings[4].target_file.as_deref(), Some("lists/tests.py"));
    assert_eq!(listings[4].commit_label, None);

    assert_eq!(listings[1].contents, "python manage.py test");
    assert_eq!(listings[1].expected_output, None);
    assert!(listings[5].skip);
    assert!(listings[6].ignore_errors);
    assert_eq!(
        listings[6].expected_output.as_deref(),
        Some("On branch main\n[...]")
    );
}

#[test]
fn parsing_is_deterministic() {
    let first = parse_listings(CHAPTER_02).expect("first");
    let second = parse_listings(CHAPTER_02).expect("second");
    assert_eq!(first, second);
}

#[test]
fn prose_between_command_and_block_breaks_the_output_link() {
    let text = "----\n$ ls\n----\n\nSome prose.\n\n----\nfile.txt\n----\n";
    let err = parse_listings(text).expect_err("kindless block");
    assert!(matches!(err, BookTesterError::Parse { line: 7, .. }));
}

#[test]
fn first_code_listing_must_name_its_file() {
    let text = "[role=\"sourcecode\"]\n----\nx = 1\n----\n";
    let err = parse_listings(text).expect_err("no file");
    assert!(matches!(err, BookTesterError::Parse { line: 2, .. }));
}

#[test]
fn continued_command_lines_are_joined() {
    let text = "----\n$ git commit \\\n    -m \"first\"\n[main 1a2b3c4] first\n----\n";
    let listings = parse_listings(text).expect("parsed");
    assert_eq!(listings.len(), 1);
    assert_eq!(listings[0].contents, "git commit -m \"first\"");
    assert_eq!(listings[0].expected_output.as_deref(), Some("[main 1a2b3c4] first"));
    assert_eq!(listings[0].address, LineRange::new(2, 4));
}
