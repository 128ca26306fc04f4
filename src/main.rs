fn main() -> anyhow::Result<()> {
    hover_translate::run()
}
