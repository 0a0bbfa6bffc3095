fn main() {
    patrol_sync::run()
}
